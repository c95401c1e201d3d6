//! Aggregation of per-backend content listings.
//!
//! Each backend reports the data files it serves as a JSON array. The
//! cluster-wide view keeps, per producer, only the files present on
//! every backend that knows the producer — a file missing anywhere is
//! not yet safely queryable through the gateway.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(rename = "Producer")]
    producer: String,
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "OriginTime")]
    origin_time: String,
    #[serde(rename = "MinTime", default)]
    min_time: String,
    #[serde(rename = "MaxTime", default)]
    max_time: String,
    #[serde(rename = "Parameters", default)]
    parameters: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QEngineFile {
    pub producer: String,
    pub path: String,
    pub origin_time: String,
    pub min_time: String,
    pub max_time: String,
    pub parameters: Vec<String>,
}

impl QEngineFile {
    fn sort_key(&self) -> (&str, &str) {
        (&self.origin_time, &self.path)
    }

    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p == name)
    }
}

pub fn parse_listing(body: &str) -> Result<Vec<QEngineFile>, String> {
    let raw: Vec<RawFile> =
        serde_json::from_str(body).map_err(|err| format!("listing deserialization failed: {err}"))?;
    Ok(raw
        .into_iter()
        .map(|file| QEngineFile {
            producer: file.producer,
            path: file.path,
            origin_time: file.origin_time,
            min_time: file.min_time,
            max_time: file.max_time,
            parameters: file
                .parameters
                .split([' ', ','])
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        })
        .collect())
}

/// Intersects the per-backend listings into per-producer file lists,
/// sorted ascending by `(OriginTime, Path)`.
pub fn cluster_contents(
    backend_listings: Vec<(String, Vec<QEngineFile>)>,
) -> BTreeMap<String, Vec<QEngineFile>> {
    let mut result: BTreeMap<String, Vec<QEngineFile>> = BTreeMap::new();

    for (_backend, files) in backend_listings {
        let mut grouped: BTreeMap<String, Vec<QEngineFile>> = BTreeMap::new();
        for file in files {
            grouped.entry(file.producer.clone()).or_default().push(file);
        }

        for (producer, mut files) in grouped {
            files.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            files.dedup_by(|a, b| a.sort_key() == b.sort_key());

            match result.remove(&producer) {
                None => {
                    result.insert(producer, files);
                }
                Some(existing) => {
                    result.insert(producer, intersect_sorted(existing, files));
                }
            }
        }
    }

    result
}

fn intersect_sorted(left: Vec<QEngineFile>, right: Vec<QEngineFile>) -> Vec<QEngineFile> {
    let mut out = Vec::new();
    let mut right_iter = right.into_iter().peekable();

    for file in left {
        loop {
            match right_iter.peek() {
                Some(candidate) if candidate.sort_key() < file.sort_key() => {
                    right_iter.next();
                }
                Some(candidate) if candidate.sort_key() == file.sort_key() => {
                    out.push(file);
                    right_iter.next();
                    break;
                }
                _ => break,
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(producer: &str, path: &str, origin: &str) -> QEngineFile {
        QEngineFile {
            producer: producer.to_string(),
            path: path.to_string(),
            origin_time: origin.to_string(),
            min_time: String::new(),
            max_time: String::new(),
            parameters: vec!["Temperature".to_string(), "Pressure".to_string()],
        }
    }

    #[test]
    fn parse_listing_splits_parameters() {
        let body = r#"[{
            "Producer": "pal",
            "Path": "/data/pal_1.sqd",
            "OriginTime": "2026-08-01 06:00",
            "MinTime": "2026-08-01 06:00",
            "MaxTime": "2026-08-03 06:00",
            "Parameters": "Temperature,Pressure WindSpeedMS"
        }]"#;
        let files = parse_listing(body).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].producer, "pal");
        assert_eq!(
            files[0].parameters,
            vec!["Temperature", "Pressure", "WindSpeedMS"]
        );
        assert!(files[0].has_parameter("Pressure"));
        assert!(!files[0].has_parameter("Humidity"));
    }

    #[test]
    fn parse_listing_rejects_garbage() {
        assert!(parse_listing("{not json").is_err());
    }

    #[test]
    fn intersection_keeps_common_files_only() {
        let alpha = vec![
            file("pal", "/d/1.sqd", "2026-08-01 00:00"),
            file("pal", "/d/2.sqd", "2026-08-02 00:00"),
        ];
        let beta = vec![file("pal", "/d/2.sqd", "2026-08-02 00:00")];

        let contents = cluster_contents(vec![
            ("alpha".to_string(), alpha),
            ("beta".to_string(), beta),
        ]);

        let pal = &contents["pal"];
        assert_eq!(pal.len(), 1);
        assert_eq!(pal[0].path, "/d/2.sqd");
    }

    #[test]
    fn producers_missing_on_one_backend_survive() {
        let alpha = vec![file("pal", "/d/1.sqd", "2026-08-01 00:00")];
        let beta = vec![file("ecmwf", "/d/e.sqd", "2026-08-01 12:00")];

        let contents = cluster_contents(vec![
            ("alpha".to_string(), alpha),
            ("beta".to_string(), beta),
        ]);

        assert_eq!(contents.len(), 2);
        assert_eq!(contents["pal"].len(), 1);
        assert_eq!(contents["ecmwf"].len(), 1);
    }

    #[test]
    fn results_are_sorted_by_origin_then_path() {
        let listing = vec![
            file("pal", "/d/b.sqd", "2026-08-02 00:00"),
            file("pal", "/d/a.sqd", "2026-08-02 00:00"),
            file("pal", "/d/c.sqd", "2026-08-01 00:00"),
        ];
        let contents = cluster_contents(vec![("alpha".to_string(), listing)]);

        let pal = &contents["pal"];
        assert_eq!(pal[0].path, "/d/c.sqd");
        assert_eq!(pal[1].path, "/d/a.sqd");
        assert_eq!(pal[2].path, "/d/b.sqd");
    }
}

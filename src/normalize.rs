//! Raw item → [`CanonicalRecord`] mapping and content fingerprints.
//!
//! Each normalizer derives the natural key deterministically from source
//! fields and returns a [`ParseError`] for items it cannot key. Lists are
//! sorted and de-duplicated at construction so that the fingerprint, a
//! SHA-256 over the record's JSON form, only changes when content does.
//! Provenance (`source_kind`, `source_updated_at`) is never hashed.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::adapters::str_field;
use crate::error::ParseError;
use crate::models::{
    AdvisoryRecord, CanonicalRecord, CveRecord, KevDetails, OsvRecord, Provenance, SourceKind,
};

/// SHA-256 hex of the record's normalized fields.
pub fn fingerprint(record: &CanonicalRecord) -> String {
    let bytes = match record {
        CanonicalRecord::Cve { record, .. } => serde_json::to_vec(record),
        CanonicalRecord::Osv { record, .. } => serde_json::to_vec(record),
        CanonicalRecord::Advisory { record, .. } => serde_json::to_vec(record),
    }
    .unwrap_or_default();
    sha256_hex(&bytes)
}

/// Natural-key candidate of a raw item, if it carries one. Used to name
/// items that fail to normalize.
pub fn key_hint(raw: &Value) -> Option<&str> {
    ["id", "cveID", "ghsaId", "guid"]
        .iter()
        .find_map(|field| raw.get(*field).and_then(Value::as_str))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Accepts RFC 3339, RFC 2822, NVD's zone-less `YYYY-MM-DDTHH:MM:SS.sss`,
/// and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

/// `CVE-YYYY-NNNN`, with four or more digits in the sequence part.
pub fn is_cve_id(id: &str) -> bool {
    let mut parts = id.splitn(3, '-');
    let (Some(prefix), Some(year), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    prefix == "CVE"
        && year.len() == 4
        && year.bytes().all(|b| b.is_ascii_digit())
        && seq.len() >= 4
        && seq.bytes().all(|b| b.is_ascii_digit())
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.retain(|s| !s.trim().is_empty());
    v.sort();
    v.dedup();
    v
}

fn owned(value: &Value, key: &str) -> Option<String> {
    str_field(value, key).map(str::to_string)
}

fn array<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter())
        .into_iter()
        .flatten()
}

fn urls(value: &Value, key: &str) -> Vec<String> {
    array(value, key)
        .filter_map(|r| str_field(r, "url").map(str::to_string))
        .collect()
}

fn timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    str_field(value, key).and_then(parse_timestamp)
}

/// NVD CVE API 2.0 `cve` object.
pub fn nvd(raw: &Value) -> Result<CanonicalRecord, ParseError> {
    let err = |reason: &str| ParseError::new(SourceKind::Nvd, reason);
    let cve_id = str_field(raw, "id").ok_or_else(|| err("missing id"))?;
    if !is_cve_id(cve_id) {
        return Err(err(&format!("invalid CVE id '{}'", cve_id)));
    }

    let description = array(raw, "descriptions")
        .find(|d| d.get("lang").and_then(Value::as_str) == Some("en"))
        .and_then(|d| owned(d, "value"));

    let (cvss_score, cvss_severity) = cvss(raw.get("metrics").unwrap_or(&Value::Null));

    let cwes = array(raw, "weaknesses")
        .flat_map(|w| array(w, "description"))
        .filter_map(|d| owned(d, "value"))
        .filter(|v| v.starts_with("CWE-"))
        .collect();

    let cpes = array(raw, "configurations")
        .flat_map(|c| array(c, "nodes"))
        .flat_map(|n| array(n, "cpeMatch"))
        .filter_map(|m| owned(m, "criteria"))
        .collect();

    Ok(CanonicalRecord::Cve {
        record: CveRecord {
            cve_id: cve_id.to_string(),
            description,
            published_at: timestamp(raw, "published"),
            cvss_score,
            cvss_severity,
            cwes: sorted(cwes),
            cpes: sorted(cpes),
            references: sorted(urls(raw, "references")),
            is_kev: false,
            kev: None,
        },
        provenance: Provenance {
            source_kind: SourceKind::Nvd,
            source_updated_at: timestamp(raw, "lastModified"),
        },
    })
}

/// Preferred CVSS metric: v3.1, then v3.0, then v2.
fn cvss(metrics: &Value) -> (Option<f64>, Option<String>) {
    for key in ["cvssMetricV31", "cvssMetricV30", "cvssMetricV2"] {
        if let Some(metric) = array(metrics, key).next() {
            let data = metric.get("cvssData").unwrap_or(&Value::Null);
            let score = data.get("baseScore").and_then(Value::as_f64);
            // v2 keeps baseSeverity next to cvssData rather than inside it.
            let severity = owned(data, "baseSeverity").or_else(|| owned(metric, "baseSeverity"));
            if score.is_some() {
                return (score, severity);
            }
        }
    }
    (None, None)
}

/// CISA Known Exploited Vulnerabilities catalog entry.
pub fn kev(raw: &Value) -> Result<CanonicalRecord, ParseError> {
    let err = |reason: &str| ParseError::new(SourceKind::CisaKev, reason);
    let cve_id = str_field(raw, "cveID").ok_or_else(|| err("missing cveID"))?;
    if !is_cve_id(cve_id) {
        return Err(err(&format!("invalid CVE id '{}'", cve_id)));
    }
    let cwes = array(raw, "cwes")
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    Ok(CanonicalRecord::Cve {
        record: CveRecord {
            cve_id: cve_id.to_string(),
            description: owned(raw, "shortDescription"),
            published_at: None,
            cvss_score: None,
            cvss_severity: None,
            cwes: sorted(cwes),
            cpes: Vec::new(),
            references: Vec::new(),
            is_kev: true,
            kev: Some(KevDetails {
                vendor_project: owned(raw, "vendorProject"),
                product: owned(raw, "product"),
                vulnerability_name: owned(raw, "vulnerabilityName"),
                date_added: owned(raw, "dateAdded"),
                required_action: owned(raw, "requiredAction"),
                due_date: owned(raw, "dueDate"),
                known_ransomware_use: owned(raw, "knownRansomwareCampaignUse"),
            }),
        },
        provenance: Provenance {
            source_kind: SourceKind::CisaKev,
            source_updated_at: timestamp(raw, "dateAdded"),
        },
    })
}

/// OSV schema vulnerability.
pub fn osv(raw: &Value) -> Result<CanonicalRecord, ParseError> {
    let id = str_field(raw, "id")
        .ok_or_else(|| ParseError::new(SourceKind::Osv, "missing id"))?;

    let packages: Vec<(String, String)> = array(raw, "affected")
        .filter_map(|a| a.get("package"))
        .filter_map(|p| Some((owned(p, "ecosystem")?, owned(p, "name")?)))
        .collect();

    let severity = raw
        .get("database_specific")
        .and_then(|d| owned(d, "severity"))
        .or_else(|| array(raw, "severity").find_map(|s| owned(s, "score")));

    let aliases = array(raw, "aliases")
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    Ok(CanonicalRecord::Osv {
        record: OsvRecord {
            osv_id: id.to_string(),
            aliases: sorted(aliases),
            summary: owned(raw, "summary"),
            details: owned(raw, "details"),
            ecosystem: packages.first().map(|(e, _)| e.clone()),
            package: packages.first().map(|(_, n)| n.clone()),
            affected_packages: sorted(packages.iter().map(|(e, n)| format!("{e}/{n}")).collect()),
            severity,
            published_at: timestamp(raw, "published"),
            references: sorted(urls(raw, "references")),
        },
        provenance: Provenance {
            source_kind: SourceKind::Osv,
            source_updated_at: timestamp(raw, "modified"),
        },
    })
}

/// GitHub `SecurityAdvisory` GraphQL node, mapped onto the OSV shape.
pub fn ghsa(raw: &Value) -> Result<CanonicalRecord, ParseError> {
    let id = str_field(raw, "ghsaId")
        .ok_or_else(|| ParseError::new(SourceKind::Ghsa, "missing ghsaId"))?;

    let aliases = array(raw, "identifiers")
        .filter_map(|i| owned(i, "value"))
        .filter(|v| v != id)
        .collect();

    let packages: Vec<(String, String)> = raw
        .get("vulnerabilities")
        .map(|v| array(v, "nodes").collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|n| n.get("package"))
        .filter_map(|p| Some((owned(p, "ecosystem")?, owned(p, "name")?)))
        .collect();

    let mut references = urls(raw, "references");
    references.extend(owned(raw, "permalink"));

    Ok(CanonicalRecord::Osv {
        record: OsvRecord {
            osv_id: id.to_string(),
            aliases: sorted(aliases),
            summary: owned(raw, "summary"),
            details: owned(raw, "description"),
            ecosystem: packages.first().map(|(e, _)| e.clone()),
            package: packages.first().map(|(_, n)| n.clone()),
            affected_packages: sorted(packages.iter().map(|(e, n)| format!("{e}/{n}")).collect()),
            severity: owned(raw, "severity"),
            published_at: timestamp(raw, "publishedAt"),
            references: sorted(references),
        },
        provenance: Provenance {
            source_kind: SourceKind::Ghsa,
            source_updated_at: timestamp(raw, "updatedAt"),
        },
    })
}

/// Natural key of a feed item: GUID, else hash of the link, else of the title.
pub fn advisory_key(raw: &Value) -> Option<String> {
    if let Some(guid) = str_field(raw, "guid") {
        return Some(guid.to_string());
    }
    str_field(raw, "link")
        .or_else(|| str_field(raw, "title"))
        .map(|s| sha256_hex(s.as_bytes()))
}

/// Flattened RSS/Atom item as produced by the feed adapter.
pub fn advisory(raw: &Value, kind: SourceKind) -> Result<CanonicalRecord, ParseError> {
    let guid = advisory_key(raw)
        .ok_or_else(|| ParseError::new(kind, "feed item has no guid, link, or title"))?;
    let published_at = timestamp(raw, "published");

    Ok(CanonicalRecord::Advisory {
        record: AdvisoryRecord {
            guid,
            feed: owned(raw, "feed").unwrap_or_else(|| kind.to_string()),
            title: owned(raw, "title"),
            link: owned(raw, "link"),
            summary: owned(raw, "summary"),
            published_at,
        },
        provenance: Provenance {
            source_kind: kind,
            source_updated_at: published_at,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn nvd_item() -> Value {
        json!({
            "id": "CVE-2024-12345",
            "published": "2024-05-01T10:15:00.000",
            "lastModified": "2024-05-03T08:00:00.000",
            "descriptions": [
                {"lang": "es", "value": "desbordamiento"},
                {"lang": "en", "value": "Heap overflow in parser."}
            ],
            "metrics": {
                "cvssMetricV2": [{"cvssData": {"baseScore": 5.0}, "baseSeverity": "MEDIUM"}],
                "cvssMetricV31": [{"cvssData": {"baseScore": 9.8, "baseSeverity": "CRITICAL"}}]
            },
            "weaknesses": [{"description": [{"lang": "en", "value": "CWE-787"}, {"lang": "en", "value": "NVD-CWE-noinfo"}]}],
            "configurations": [{"nodes": [{"cpeMatch": [
                {"criteria": "cpe:2.3:a:acme:parser:1.0:*:*:*:*:*:*:*"},
                {"criteria": "cpe:2.3:a:acme:parser:1.0:*:*:*:*:*:*:*"}
            ]}]}],
            "references": [{"url": "https://b.example"}, {"url": "https://a.example"}]
        })
    }

    #[test]
    fn test_nvd_mapping() {
        let rec = nvd(&nvd_item()).unwrap();
        let CanonicalRecord::Cve { record, provenance } = &rec else {
            panic!("expected cve");
        };
        assert_eq!(record.cve_id, "CVE-2024-12345");
        assert_eq!(record.description.as_deref(), Some("Heap overflow in parser."));
        assert_eq!(record.cvss_score, Some(9.8));
        assert_eq!(record.cvss_severity.as_deref(), Some("CRITICAL"));
        assert_eq!(record.cwes, vec!["CWE-787"]);
        assert_eq!(record.cpes.len(), 1);
        assert_eq!(record.references, vec!["https://a.example", "https://b.example"]);
        assert_eq!(
            provenance.source_updated_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_nvd_v2_fallback_reads_outer_severity() {
        let mut item = nvd_item();
        item["metrics"] = json!({"cvssMetricV2": [{"cvssData": {"baseScore": 5.0}, "baseSeverity": "MEDIUM"}]});
        let CanonicalRecord::Cve { record, .. } = nvd(&item).unwrap() else {
            panic!("expected cve");
        };
        assert_eq!(record.cvss_score, Some(5.0));
        assert_eq!(record.cvss_severity.as_deref(), Some("MEDIUM"));
    }

    #[test]
    fn test_nvd_rejects_bad_ids() {
        assert!(nvd(&json!({"descriptions": []})).is_err());
        assert!(nvd(&json!({"id": "CVE-24-1"})).is_err());
        assert!(nvd(&json!({"id": "GHSA-xxxx"})).is_err());
    }

    #[test]
    fn test_fingerprint_ignores_provenance_and_list_order() {
        let a = nvd(&nvd_item()).unwrap();
        let mut item = nvd_item();
        item["lastModified"] = json!("2024-06-01T00:00:00.000");
        item["references"] = json!([{"url": "https://a.example"}, {"url": "https://b.example"}]);
        let b = nvd(&item).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));

        item["descriptions"] = json!([{"lang": "en", "value": "Changed."}]);
        let c = nvd(&item).unwrap();
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_kev_mapping() {
        let rec = kev(&json!({
            "cveID": "CVE-2023-4966",
            "vendorProject": "Citrix",
            "product": "NetScaler",
            "dateAdded": "2023-10-18",
            "requiredAction": "Apply mitigations",
            "dueDate": "2023-11-08",
            "knownRansomwareCampaignUse": "Known",
            "shortDescription": "Buffer overflow"
        }))
        .unwrap();
        let CanonicalRecord::Cve { record, provenance } = rec else {
            panic!("expected cve");
        };
        assert!(record.is_kev);
        assert_eq!(record.kev.unwrap().vendor_project.as_deref(), Some("Citrix"));
        assert_eq!(provenance.source_kind, SourceKind::CisaKev);
        assert_eq!(
            provenance.source_updated_at,
            Some(Utc.with_ymd_and_hms(2023, 10, 18, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_osv_mapping() {
        let rec = osv(&json!({
            "id": "PYSEC-2024-1",
            "aliases": ["CVE-2024-1", "GHSA-aaaa-bbbb-cccc", "CVE-2024-1"],
            "summary": "RCE",
            "modified": "2024-05-02T00:00:00Z",
            "affected": [
                {"package": {"ecosystem": "PyPI", "name": "requests"}},
                {"package": {"ecosystem": "PyPI", "name": "urllib3"}}
            ],
            "database_specific": {"severity": "HIGH"}
        }))
        .unwrap();
        let CanonicalRecord::Osv { record, .. } = rec else {
            panic!("expected osv");
        };
        assert_eq!(record.aliases, vec!["CVE-2024-1", "GHSA-aaaa-bbbb-cccc"]);
        assert_eq!(record.ecosystem.as_deref(), Some("PyPI"));
        assert_eq!(record.package.as_deref(), Some("requests"));
        assert_eq!(record.affected_packages, vec!["PyPI/requests", "PyPI/urllib3"]);
        assert_eq!(record.severity.as_deref(), Some("HIGH"));
    }

    #[test]
    fn test_ghsa_mapping() {
        let rec = ghsa(&json!({
            "ghsaId": "GHSA-2222-3333-4444",
            "summary": "Prototype pollution",
            "severity": "MODERATE",
            "updatedAt": "2024-05-05T00:00:00Z",
            "permalink": "https://github.com/advisories/GHSA-2222-3333-4444",
            "identifiers": [{"type": "GHSA", "value": "GHSA-2222-3333-4444"}, {"type": "CVE", "value": "CVE-2024-7"}],
            "references": [{"url": "https://nvd.nist.gov/vuln/detail/CVE-2024-7"}],
            "vulnerabilities": {"nodes": [{"package": {"ecosystem": "NPM", "name": "lodash"}}]}
        }))
        .unwrap();
        let CanonicalRecord::Osv { record, provenance } = rec else {
            panic!("expected osv");
        };
        assert_eq!(record.osv_id, "GHSA-2222-3333-4444");
        assert_eq!(record.aliases, vec!["CVE-2024-7"]);
        assert_eq!(record.affected_packages, vec!["NPM/lodash"]);
        assert_eq!(record.references.len(), 2);
        assert_eq!(provenance.source_kind, SourceKind::Ghsa);
    }

    #[test]
    fn test_advisory_key_fallbacks() {
        assert_eq!(advisory_key(&json!({"guid": " a ", "link": "x"})).unwrap(), "a");
        assert_eq!(
            advisory_key(&json!({"link": "https://x"})).unwrap(),
            sha256_hex(b"https://x")
        );
        assert_eq!(advisory_key(&json!({"title": "T"})).unwrap(), sha256_hex(b"T"));
        assert!(advisory(&json!({"summary": "orphan"}), SourceKind::Rss).is_err());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("Fri, 01 Mar 2024 12:00:00 GMT"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:00:00.000"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-01"),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_key_hint_names_the_item() {
        assert_eq!(key_hint(&json!({"cveID": "CVE-2024-1", "dateAdded": 7})), Some("CVE-2024-1"));
        assert_eq!(key_hint(&json!({"ghsaId": "GHSA-aaaa-bbbb-cccc"})), Some("GHSA-aaaa-bbbb-cccc"));
        assert_eq!(key_hint(&json!({"guid": "adv-1"})), Some("adv-1"));
        assert_eq!(key_hint(&json!({"id": 42})), None);
        assert_eq!(key_hint(&json!("not an object")), None);
    }
}

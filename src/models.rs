//! Queue row, worker, and sanitized-document types (§3, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The document class a job belongs to. `PlanCadastraux` jobs skip OCR
/// entirely and are never claimed by a worker (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSource {
    Index,
    Acte,
    PlanCadastraux,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::Index => "index",
            DocumentSource::Acte => "acte",
            DocumentSource::PlanCadastraux => "plan_cadastraux",
        }
    }
}

impl std::str::FromStr for DocumentSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "index" => Ok(DocumentSource::Index),
            "acte" => Ok(DocumentSource::Acte),
            "plan_cadastraux" => Ok(DocumentSource::PlanCadastraux),
            other => Err(format!("unknown document_source: {other}")),
        }
    }
}

/// Job lifecycle status (§3). Numeric values match the queue table's
/// `status_id` column exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending = 1,
    Extracting = 2,
    Extracted = 3,
    Error = 4,
    OcrComplete = 5,
    OcrInProgress = 6,
}

impl JobStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(JobStatus::Pending),
            2 => Some(JobStatus::Extracting),
            3 => Some(JobStatus::Extracted),
            4 => Some(JobStatus::Error),
            5 => Some(JobStatus::OcrComplete),
            6 => Some(JobStatus::OcrInProgress),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// A row of the queue table (§3). Only the columns the OCR pool reads or
/// writes are modeled; upstream extraction columns pass through untouched.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub document_source: DocumentSource,
    pub document_number: Option<String>,
    pub document_number_normalized: Option<String>,
    pub circonscription: Option<String>,
    pub cadastre: Option<String>,
    pub designation_secondaire: Option<String>,
    pub status_id: i64,
    pub storage_path: Option<String>,
    pub file_content: Option<String>,
    pub boosted_file_content: Option<String>,
    pub worker_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error_message: Option<String>,
    pub ocr_worker_id: Option<String>,
    pub ocr_started_at: Option<DateTime<Utc>>,
    pub ocr_completed_at: Option<DateTime<Utc>>,
    pub ocr_attempts: i64,
    pub ocr_max_attempts: i64,
    pub ocr_error: Option<String>,
    pub ocr_last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A worker's job-class assignment (§3 Glossary: Mode). `mode` is mutable
/// between jobs via the Pool Manager, never mid-job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Index,
    Acte,
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub worker_id: String,
    pub mode: WorkerMode,
    pub temp_dir: std::path::PathBuf,
}

/// Per-page metadata extracted by the sanitizer (§6, §4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub circonscription: Option<String>,
    pub cadastre: Option<String>,
    pub lot_number: Option<String>,
}

/// One party to an inscription (§4.8 party-splitting rules).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub role: String,
}

/// One `Ligne N:` line-item within a page (§4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inscription {
    pub acte_publication_date: Option<String>,
    pub acte_publication_number: Option<String>,
    pub acte_nature: Option<String>,
    pub parties: Vec<Party>,
    pub remarques: Option<String>,
    pub radiation_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedPage {
    #[serde(rename = "pageNumber")]
    pub page_number: u32,
    pub metadata: PageMetadata,
    pub inscriptions: Vec<Inscription>,
}

/// Final deterministic output of the sanitizer (§4.8, §6). Produced once per
/// index job and immutable after (I2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedDocument {
    pub pages: Vec<SanitizedPage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_source_round_trips_through_str() {
        for s in ["index", "acte", "plan_cadastraux"] {
            let parsed: DocumentSource = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }

    #[test]
    fn job_status_round_trips_through_i64() {
        for v in 1..=6 {
            assert_eq!(JobStatus::from_i64(v).unwrap().as_i64(), v);
        }
        assert!(JobStatus::from_i64(0).is_none());
        assert!(JobStatus::from_i64(7).is_none());
    }

    #[test]
    fn sanitized_document_serializes_with_exact_key_names() {
        let doc = SanitizedDocument {
            pages: vec![SanitizedPage {
                page_number: 1,
                metadata: PageMetadata { circonscription: None, cadastre: None, lot_number: None },
                inscriptions: vec![],
            }],
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["pages"][0].get("pageNumber").is_some());
    }
}

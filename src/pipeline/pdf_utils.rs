//! PDF rasterization (§4.6 step 2): PDF→PNG via `pdftoppm`, grounded
//! directly in `ocr/pdf_utils.rs`'s page-image-naming convention and error
//! handling.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::PipelineError;

const PDFTOPPM_NOT_FOUND: &str = "pdftoppm not found on PATH; install poppler-utils";

/// Number of pages in a PDF, via `pdfinfo` (shipped alongside `pdftoppm` in
/// poppler-utils).
pub fn page_count(pdf_path: &Path) -> Result<u32, PipelineError> {
    let output = Command::new("pdfinfo")
        .arg(pdf_path)
        .output()
        .map_err(|e| PipelineError::Storage(format!("pdfinfo: {e}")))?;

    if !output.status.success() {
        return Err(PipelineError::Storage("pdfinfo failed".to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Pages:").map(str::trim))
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| PipelineError::Storage("pdfinfo: no Pages: line".to_string()))
}

/// Convert a single PDF page to a PNG at the configured DPI (§4.6 step 2,
/// §6 `viewport scale for PDF→image conversion`).
pub fn pdf_page_to_image(pdf_path: &Path, page: u32, dpi: u32, output_dir: &Path) -> Result<PathBuf, PipelineError> {
    let page_str = page.to_string();
    let dpi_str = dpi.to_string();
    let output_prefix = output_dir.join("page");

    let status = Command::new("pdftoppm")
        .args(["-png", "-r", &dpi_str, "-f", &page_str, "-l", &page_str])
        .arg(pdf_path)
        .arg(&output_prefix)
        .status();

    match status {
        Ok(s) if s.success() => find_page_image(output_dir, page)
            .ok_or_else(|| PipelineError::Storage(format!("no image generated for page {page}"))),
        Ok(_) => Err(PipelineError::Storage("pdftoppm failed to convert PDF page".to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::Storage(PDFTOPPM_NOT_FOUND.to_string())),
        Err(e) => Err(PipelineError::Storage(e.to_string())),
    }
}

/// `pdftoppm` names files like `page-01.png`, `page-02.png`; the padding
/// width varies with total page count.
pub fn find_page_image(dir: &Path, page_num: u32) -> Option<PathBuf> {
    for digits in [2, 3, 4] {
        let filename = format!("page-{:0width$}.png", page_num, width = digits);
        let path = dir.join(&filename);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

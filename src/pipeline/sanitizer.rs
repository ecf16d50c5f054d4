//! Sanitizer (§4.8, index documents only): a pure, deterministic transform
//! from verbose boosted text to the strict `SanitizedDocument` schema.
//! Never calls external services; never panics on malformed input (§4.8
//! "Failure policy").
//!
//! No teacher module does this kind of tolerant text parsing, so this is
//! built from the spec directly, in the regex-based style the rest of the
//! crate uses for field extraction (`regex` is already a teacher
//! dependency, reused here for its intended purpose).

use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

use crate::models::{Inscription, PageMetadata, Party, SanitizedDocument, SanitizedPage};

const PLACEHOLDER_EMPTY: &str = "[Vide]";

const FIELD_NAMES: &[&str] = &[
    "Date de présentation d'inscription",
    "Numéro",
    "Nature de l'acte",
    "Qualité",
    "Nom des parties",
    "Remarques",
    "Radiations",
];

static PAGE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*---\s*Page\s+(\d+)\s*---[ \t]*$").unwrap());

static CIRCONSCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)circonscription\s+fonci[eè]re\s*:\s*(.+)").unwrap());
static CADASTRE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bcadastre\s*:\s*(.+)").unwrap());
static LOT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blot\s*:\s*(.+)").unwrap());

static LIGNE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?mi)^[ \t>*•\-]*Ligne\s+(\d+)\s*:").unwrap());

static OPTION1_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)Option\s*1\s*:\s*(.*?)\s*\(Confiance\s*:\s*\d+\s*%\)").unwrap());

static ROLE_INDICATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\d+\s*(?:ere|ière|ieme|ième)\s+partie").unwrap());

// `regex` doesn't support look-around, so the name run is matched up to and
// including its trailing comma; `.start()` still lands on the name's first
// character, which is all `split_parties` needs.
static SURNAME_BOUNDARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-ZÀ-Ý][A-ZÀ-Ý\-]*(?:\s+[A-ZÀ-Ý][A-ZÀ-Ý\-]*)*\s*,").unwrap());

fn field_header_re() -> Regex {
    let alternation = FIELD_NAMES
        .iter()
        .map(|name| regex::escape(name))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"(?im)^[ \t>*•\-]*({alternation})\s*:?[ \t]*\r?\n?")).unwrap()
}

/// `sanitize`: split on page markers, extract metadata and inscriptions per
/// page. Never throws; a malformed input yields a single empty page (§4.8).
pub fn sanitize(boosted_text: &str) -> SanitizedDocument {
    let raw_pages = split_pages(boosted_text);
    let mut pages = Vec::with_capacity(raw_pages.len());

    for (page_number, content) in &raw_pages {
        let metadata = extract_metadata(content);
        let inscriptions = extract_inscriptions(content);
        pages.push(SanitizedPage { page_number: *page_number, metadata, inscriptions });
    }

    if pages.is_empty() {
        let preview: String = boosted_text.chars().take(500).collect();
        warn!(preview = %preview, "sanitizer produced no pages from input, emitting minimal document");
        pages.push(SanitizedPage {
            page_number: 1,
            metadata: PageMetadata { circonscription: None, cadastre: None, lot_number: None },
            inscriptions: Vec::new(),
        });
    }

    SanitizedDocument { pages }
}

/// §4.8 page splitting: split on `--- Page N ---`; if absent, the whole
/// input is page 1.
fn split_pages(text: &str) -> Vec<(u32, String)> {
    let markers: Vec<_> = PAGE_MARKER_RE.captures_iter(text).collect();
    if markers.is_empty() {
        if text.trim().is_empty() {
            return Vec::new();
        }
        return vec![(1, text.to_string())];
    }

    let mut pages = Vec::with_capacity(markers.len());
    for (i, cap) in markers.iter().enumerate() {
        let whole = cap.get(0).unwrap();
        let page_number: u32 = cap[1].parse().unwrap_or((i + 1) as u32);
        let content_start = whole.end();
        let content_end = markers.get(i + 1).map(|m| m.get(0).unwrap().start()).unwrap_or(text.len());
        pages.push((page_number, text[content_start..content_end].to_string()));
    }
    pages
}

fn normalize(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(PLACEHOLDER_EMPTY) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_match<'a>(re: &Regex, text: &'a str) -> Option<&'a str> {
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

fn extract_metadata(page_text: &str) -> PageMetadata {
    PageMetadata {
        circonscription: first_match(&CIRCONSCRIPTION_RE, page_text).and_then(normalize),
        cadastre: first_match(&CADASTRE_RE, page_text).and_then(normalize),
        lot_number: first_match(&LOT_RE, page_text).and_then(normalize),
    }
}

/// §4.8 inscription discovery: find all `Ligne <k>:` sections in source
/// order and extract their fields.
fn extract_inscriptions(page_text: &str) -> Vec<Inscription> {
    let markers: Vec<_> = LIGNE_RE.find_iter(page_text).collect();
    markers
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let start = m.end();
            let end = markers.get(i + 1).map(|next| next.start()).unwrap_or(page_text.len());
            build_inscription(&page_text[start..end])
        })
        .collect()
}

fn build_inscription(section: &str) -> Inscription {
    let date = extract_field(section, "Date de présentation d'inscription");
    let numero = extract_field(section, "Numéro");
    let nature = extract_field(section, "Nature de l'acte");
    let qualite = extract_field(section, "Qualité");
    let noms = extract_field(section, "Nom des parties");
    let remarques = extract_field(section, "Remarques");
    let radiations = extract_field(section, "Radiations");

    let parties = split_parties(qualite.as_deref(), noms.as_deref());

    Inscription {
        acte_publication_date: date,
        acte_publication_number: numero,
        acte_nature: nature,
        parties,
        remarques,
        radiation_number: radiations,
    }
}

/// §4.8 field extraction: prefer `Option 1: <value> (Confiance: NN%)`,
/// otherwise the simple `Field: <value>` form.
fn extract_field(section: &str, field_name: &str) -> Option<String> {
    let header_re = field_header_re();
    let matches: Vec<_> = header_re.captures_iter(section).collect();

    let (idx, cap) = matches
        .iter()
        .enumerate()
        .find(|(_, cap)| cap.get(1).unwrap().as_str().eq_ignore_ascii_case(field_name))?;

    let block_start = cap.get(0).unwrap().end();
    let block_end = matches.get(idx + 1).map(|m| m.get(0).unwrap().start()).unwrap_or(section.len());
    let block = &section[block_start..block_end];

    if let Some(opt) = OPTION1_RE.captures(block).and_then(|c| c.get(1)) {
        return normalize(opt.as_str());
    }

    let first_line = block.lines().next().unwrap_or("");
    normalize(first_line)
}

/// §4.8 party parsing. Splits `Nom des parties` against `Qualité`'s role
/// indicators when at least two are present; otherwise keeps both raw
/// strings as a single compound entry (the heuristic's documented
/// conservative fallback).
fn split_parties(qualite: Option<&str>, noms: Option<&str>) -> Vec<Party> {
    let (qualite, noms) = match (qualite, noms) {
        (None, None) => return Vec::new(),
        (q, n) => (q.unwrap_or(""), n.unwrap_or("")),
    };

    let roles: Vec<&str> = ROLE_INDICATOR_RE.find_iter(qualite).map(|m| m.as_str()).collect();
    if roles.len() >= 2 {
        let starts: Vec<usize> = SURNAME_BOUNDARY_RE.find_iter(noms).map(|m| m.start()).collect();
        if starts.len() >= roles.len() {
            let mut parties = Vec::with_capacity(roles.len());
            for (i, role) in roles.iter().enumerate() {
                let begin = starts[i];
                let end = starts.get(i + 1).copied().unwrap_or(noms.len());
                let name = noms[begin..end].trim().trim_end_matches([';', ',']).trim().to_string();
                parties.push(Party { name, role: role.trim().to_string() });
            }
            return parties;
        }
    }

    vec![Party { name: noms.trim().to_string(), role: qualite.trim().to_string() }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_marker_treats_whole_input_as_page_one() {
        let doc = sanitize("Circonscription foncière: Montréal\nLigne 1:\nNuméro: 12345");
        assert_eq!(doc.pages.len(), 1);
        assert_eq!(doc.pages[0].page_number, 1);
    }

    #[test]
    fn splits_on_page_markers_in_order() {
        let text = "--- Page 1 ---\nCadastre: A\n--- Page 2 ---\nCadastre: B";
        let doc = sanitize(text);
        assert_eq!(doc.pages.len(), 2);
        assert_eq!(doc.pages[0].metadata.cadastre.as_deref(), Some("A"));
        assert_eq!(doc.pages[1].metadata.cadastre.as_deref(), Some("B"));
    }

    #[test]
    fn empty_input_falls_back_to_single_minimal_page() {
        // `sanitize` never throws (§4.8 Failure policy): genuinely empty
        // input still yields a document, not zero pages. The index pipeline
        // is the one that special-cases a zero-page PDF before ever calling
        // into the sanitizer.
        let doc = sanitize("");
        assert_eq!(doc.pages.len(), 1);
        assert!(doc.pages[0].inscriptions.is_empty());
    }

    #[test]
    fn metadata_is_tolerant_of_bullets_and_case() {
        let doc = sanitize("- circonscription FONCIÈRE: Québec\n* lot: 42\nCadastre: Rimouski");
        let meta = &doc.pages[0].metadata;
        assert_eq!(meta.circonscription.as_deref(), Some("Québec"));
        assert_eq!(meta.lot_number.as_deref(), Some("42"));
        assert_eq!(meta.cadastre.as_deref(), Some("Rimouski"));
    }

    #[test]
    fn option_1_is_selected_regardless_of_confidence() {
        let section = "Ligne 1:\nNuméro:\nOption 1: X (Confiance: 1%)\nOption 2: Y (Confiance: 99%)\n";
        let doc = sanitize(section);
        assert_eq!(doc.pages[0].inscriptions[0].acte_publication_number.as_deref(), Some("X"));
    }

    #[test]
    fn vide_placeholder_maps_to_null() {
        let section = "Ligne 1:\nRemarques: [Vide]\n";
        let doc = sanitize(section);
        assert_eq!(doc.pages[0].inscriptions[0].remarques, None);
    }

    #[test]
    fn simple_field_form_falls_back_correctly() {
        let section = "Ligne 1:\nNature de l'acte: Vente\n";
        let doc = sanitize(section);
        assert_eq!(doc.pages[0].inscriptions[0].acte_nature.as_deref(), Some("Vente"));
    }

    #[test]
    fn single_role_yields_single_party() {
        let section = "Ligne 1:\nQualité: Créancier Débiteur\nNom des parties: BANQUE NATIONALE, Jean Tremblay\n";
        let doc = sanitize(section);
        let parties = &doc.pages[0].inscriptions[0].parties;
        assert_eq!(parties.len(), 1);
        assert_eq!(parties[0].role, "Créancier Débiteur");
    }

    #[test]
    fn two_role_indicators_split_into_two_parties_in_order() {
        let section = "Ligne 1:\nQualité: 1ere partie 2ieme partie\nNom des parties: TREMBLAY, Jean, MARTIN, Sophie\n";
        let doc = sanitize(section);
        let parties = &doc.pages[0].inscriptions[0].parties;
        assert_eq!(parties.len(), 2);
        assert!(parties[0].name.starts_with("TREMBLAY"));
        assert!(parties[1].name.starts_with("MARTIN"));
    }

    #[test]
    fn multiple_ligne_sections_are_discovered_in_order() {
        let text = "Ligne 1:\nNuméro: 1\nLigne 2:\nNuméro: 2\n";
        let doc = sanitize(text);
        assert_eq!(doc.pages[0].inscriptions.len(), 2);
        assert_eq!(doc.pages[0].inscriptions[0].acte_publication_number.as_deref(), Some("1"));
        assert_eq!(doc.pages[0].inscriptions[1].acte_publication_number.as_deref(), Some("2"));
    }

    #[test]
    fn sanitize_is_pure_and_idempotent_on_input() {
        let text = "--- Page 1 ---\nCadastre: A\nLigne 1:\nNuméro: 1\n";
        let a = serde_json::to_string(&sanitize(text)).unwrap();
        let b = serde_json::to_string(&sanitize(text)).unwrap();
        assert_eq!(a, b);
    }
}

//! File Analyser
//!
//! SHA-256 over downloaded blobs plus a tagged set of optional capability
//! providers: signature scan, printable strings, metadata, format carving.
//! A missing provider reports `not_available` and never aborts the scan.

use crate::config::ProviderToggles;
use crate::downloader::DownloadedFile;
use crate::{
    CarvedSignature, CarvingReport, FileAnalysis, MalwareReport, MetadataReport, StringsReport,
    ThreatMatch,
};
use aho_corasick::AhoCorasick;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

const STRING_SAMPLE_LIMIT: usize = 20;
const STRING_MIN_RUN: usize = 4;
const STRING_SAMPLE_MAX_LEN: usize = 120;
const CARVE_MATCH_LIMIT: usize = 32;

// The standard antivirus test string, split so this source file is not
// itself flagged by scanners.
fn eicar_signature() -> Vec<u8> {
    let mut sig = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR".to_vec();
    sig.extend_from_slice(b"-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*");
    sig
}

/// Byte-signature and known-hash scanner.
pub struct SignatureScanner {
    enabled: bool,
    automaton: AhoCorasick,
    names: Vec<ThreatMatch>,
    known_hashes: BTreeMap<String, ThreatMatch>,
}

impl SignatureScanner {
    pub fn new(enabled: bool) -> Self {
        let patterns: Vec<Vec<u8>> = vec![eicar_signature()];
        let names = vec![ThreatMatch {
            name: "Eicar-Test-Signature".to_string(),
            kind: "test".to_string(),
        }];
        Self {
            enabled,
            automaton: AhoCorasick::new(&patterns).expect("signature automaton"),
            names,
            known_hashes: BTreeMap::new(),
        }
    }

    /// Register a known-bad SHA-256 (lowercase hex).
    pub fn add_known_hash(&mut self, sha256: &str, name: &str, kind: &str) {
        self.known_hashes.insert(
            sha256.to_lowercase(),
            ThreatMatch {
                name: name.to_string(),
                kind: kind.to_string(),
            },
        );
    }

    pub fn available(&self) -> bool {
        self.enabled
    }

    pub fn run(&self, bytes: &[u8], sha256: &str) -> MalwareReport {
        let mut threats: Vec<ThreatMatch> = Vec::new();

        if let Some(hit) = self.known_hashes.get(&sha256.to_lowercase()) {
            threats.push(hit.clone());
        }
        let mut seen: HashSet<usize> = HashSet::new();
        for m in self.automaton.find_iter(bytes) {
            if seen.insert(m.pattern().as_usize()) {
                threats.push(self.names[m.pattern().as_usize()].clone());
            }
        }

        let detected = !threats.is_empty();
        MalwareReport {
            success: true,
            error: None,
            status: if detected { "infected" } else { "clean" }.to_string(),
            detected,
            threats,
        }
    }
}

/// Printable-run extractor.
pub struct StringsExtractor {
    enabled: bool,
}

impl StringsExtractor {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn available(&self) -> bool {
        self.enabled
    }

    pub fn run(&self, bytes: &[u8]) -> StringsReport {
        let mut count = 0usize;
        let mut samples = Vec::new();
        let mut run = String::new();
        for &b in bytes.iter().chain(std::iter::once(&0u8)) {
            if (0x20..=0x7e).contains(&b) {
                run.push(b as char);
            } else {
                if run.len() >= STRING_MIN_RUN {
                    count += 1;
                    if samples.len() < STRING_SAMPLE_LIMIT {
                        let mut s = run.clone();
                        s.truncate(STRING_SAMPLE_MAX_LEN);
                        samples.push(s);
                    }
                }
                run.clear();
            }
        }
        StringsReport {
            success: true,
            error: None,
            count,
            samples,
        }
    }
}

/// Flat-map metadata extractor.
pub struct MetadataExtractor {
    enabled: bool,
}

impl MetadataExtractor {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn available(&self) -> bool {
        self.enabled
    }

    pub fn run(&self, file: &DownloadedFile, sha256: &str) -> MetadataReport {
        let mut fields = BTreeMap::new();
        fields.insert("file_name".to_string(), file.file_name.clone());
        fields.insert("size_bytes".to_string(), file.bytes.len().to_string());
        fields.insert("sha256".to_string(), sha256.to_string());
        fields.insert(
            "magic".to_string(),
            detect_magic(&file.bytes).unwrap_or("unknown").to_string(),
        );
        if let Some(ct) = &file.content_type {
            fields.insert("content_type".to_string(), ct.clone());
        }
        if let Some((_, ext)) = file.file_name.rsplit_once('.') {
            fields.insert("extension".to_string(), ext.to_lowercase());
        }
        fields.insert(
            "entropy".to_string(),
            format!("{:.2}", shannon_entropy(&file.bytes)),
        );
        fields.insert(
            "printable_ratio".to_string(),
            format!("{:.2}", printable_ratio(&file.bytes)),
        );
        MetadataReport {
            success: true,
            error: None,
            fields,
        }
    }
}

/// Embedded format-marker sweep.
pub struct CarvingScanner {
    enabled: bool,
    automaton: AhoCorasick,
    formats: Vec<&'static str>,
}

const CARVE_MARKERS: &[(&[u8], &str)] = &[
    (b"MZ", "dos_executable"),
    (b"\x7fELF", "elf"),
    (b"PK\x03\x04", "zip"),
    (b"%PDF", "pdf"),
    (b"\x89PNG\r\n\x1a\n", "png"),
    (b"GIF87a", "gif"),
    (b"GIF89a", "gif"),
    (b"\xff\xd8\xff", "jpeg"),
    (b"Rar!\x1a\x07", "rar"),
    (b"7z\xbc\xaf\x27\x1c", "7z"),
    (b"\x1f\x8b", "gzip"),
];

impl CarvingScanner {
    pub fn new(enabled: bool) -> Self {
        let patterns: Vec<&[u8]> = CARVE_MARKERS.iter().map(|(p, _)| *p).collect();
        let formats: Vec<&'static str> = CARVE_MARKERS.iter().map(|(_, f)| *f).collect();
        Self {
            enabled,
            automaton: AhoCorasick::new(&patterns).expect("carving automaton"),
            formats,
        }
    }

    pub fn available(&self) -> bool {
        self.enabled
    }

    pub fn run(&self, bytes: &[u8]) -> CarvingReport {
        let mut signatures = Vec::new();
        for m in self.automaton.find_iter(bytes) {
            signatures.push(CarvedSignature {
                format: self.formats[m.pattern().as_usize()].to_string(),
                offset: m.start(),
            });
            if signatures.len() >= CARVE_MATCH_LIMIT {
                break;
            }
        }
        CarvingReport {
            success: true,
            error: None,
            signatures,
        }
    }
}

/// Tagged provider set: each tag always produces a report, present providers
/// by running, absent ones as `not_available`.
pub struct FileAnalyzer {
    signature: SignatureScanner,
    strings: StringsExtractor,
    metadata: MetadataExtractor,
    carving: CarvingScanner,
}

impl FileAnalyzer {
    pub fn new(toggles: &ProviderToggles) -> Self {
        Self {
            signature: SignatureScanner::new(toggles.signature),
            strings: StringsExtractor::new(toggles.strings),
            metadata: MetadataExtractor::new(toggles.metadata),
            carving: CarvingScanner::new(toggles.carving),
        }
    }

    pub fn signature_mut(&mut self) -> &mut SignatureScanner {
        &mut self.signature
    }

    /// Analyse one downloaded file.
    pub fn analyze(&self, file: &DownloadedFile) -> FileAnalysis {
        let file_hash = sha256_hex(&file.bytes);

        let malware = if self.signature.available() {
            self.signature.run(&file.bytes, &file_hash)
        } else {
            MalwareReport::not_available()
        };
        let strings = if self.strings.available() {
            self.strings.run(&file.bytes)
        } else {
            StringsReport::not_available()
        };
        let metadata = if self.metadata.available() {
            self.metadata.run(file, &file_hash)
        } else {
            MetadataReport::not_available()
        };
        let carving = if self.carving.available() {
            self.carving.run(&file.bytes)
        } else {
            CarvingReport::not_available()
        };

        FileAnalysis {
            file_url: file.file_url.clone(),
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            file_size: file.bytes.len() as u64,
            file_hash,
            malware,
            strings,
            metadata,
            carving,
        }
    }

    /// Analyse a batch, deduplicating by content hash: two links to the same
    /// bytes yield one analysis entry.
    pub fn analyze_all(&self, files: &[DownloadedFile]) -> Vec<FileAnalysis> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for file in files {
            let hash = sha256_hex(&file.bytes);
            if seen.insert(hash) {
                out.push(self.analyze(file));
            }
        }
        out
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn detect_magic(bytes: &[u8]) -> Option<&'static str> {
    CARVE_MARKERS
        .iter()
        .find(|(pat, _)| bytes.starts_with(pat))
        .map(|(_, name)| *name)
}

fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let len = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

fn printable_ratio(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let printable = bytes.iter().filter(|b| (0x20..=0x7e).contains(*b)).count();
    printable as f64 / bytes.len() as f64
}

//! Content Analyser
//!
//! IOC extraction regexes, tiered threat scoring and category classification
//! over normalised page text. Pure and deterministic: the same inputs always
//! produce the same verdict.

use crate::config::{ConfidenceWeights, ScoringWeights};
use crate::{RiskLevel, ThreatIndicators};
use regex::Regex;
use std::collections::BTreeSet;

/// Weight class of a threat keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Critical,
    High,
    Moderate,
}

/// One curated dictionary entry. A page keyword is reported under `name`
/// whenever any of `terms` occurs in the page. Entries without a tier feed
/// classification only, not the threat score.
pub struct KeywordEntry {
    pub name: &'static str,
    pub tier: Option<Tier>,
    pub terms: &'static [&'static str],
}

/// Curated threat-keyword dictionary. The `contact` entry carries no tier:
/// the contact signal is scored once, via `ScoringWeights::contact`, whether
/// it fires from the keyword or from an extracted email address.
pub const DICTIONARY: &[KeywordEntry] = &[
    // Critical tier
    KeywordEntry { name: "ransomware", tier: Some(Tier::Critical), terms: &["ransomware"] },
    KeywordEntry { name: "exploit", tier: Some(Tier::Critical), terms: &["exploit", "exploits"] },
    KeywordEntry { name: "carding", tier: Some(Tier::Critical), terms: &["carding"] },
    KeywordEntry { name: "cvv", tier: Some(Tier::Critical), terms: &["cvv"] },
    KeywordEntry { name: "zero-day", tier: Some(Tier::Critical), terms: &["zero-day", "0day"] },
    KeywordEntry { name: "breach", tier: Some(Tier::Critical), terms: &["breach", "breached"] },
    KeywordEntry { name: "ddos", tier: Some(Tier::Critical), terms: &["ddos"] },
    KeywordEntry { name: "botnet", tier: Some(Tier::Critical), terms: &["botnet"] },
    // High tier
    KeywordEntry { name: "marketplace", tier: Some(Tier::High), terms: &["marketplace", "market"] },
    KeywordEntry { name: "escrow", tier: Some(Tier::High), terms: &["escrow"] },
    KeywordEntry { name: "fraud", tier: Some(Tier::High), terms: &["fraud"] },
    KeywordEntry { name: "phishing", tier: Some(Tier::High), terms: &["phishing"] },
    KeywordEntry { name: "hack", tier: Some(Tier::High), terms: &["hack", "hacking", "hacked", "hacker"] },
    KeywordEntry { name: "drug", tier: Some(Tier::High), terms: &["drug", "drugs"] },
    KeywordEntry { name: "weapon", tier: Some(Tier::High), terms: &["weapon", "weapons"] },
    KeywordEntry { name: "illegal", tier: Some(Tier::High), terms: &["illegal"] },
    // Moderate tier
    KeywordEntry { name: "service", tier: Some(Tier::Moderate), terms: &["service", "services"] },
    KeywordEntry { name: "offer", tier: Some(Tier::Moderate), terms: &["offer", "offers"] },
    KeywordEntry { name: "contact", tier: None, terms: &["contact"] },
    // Classification-only entries
    KeywordEntry { name: "vendor", tier: None, terms: &["vendor", "vendors"] },
    KeywordEntry { name: "shop", tier: None, terms: &["shop", "store"] },
    KeywordEntry { name: "counterfeit", tier: None, terms: &["counterfeit"] },
    KeywordEntry { name: "bitcoin", tier: None, terms: &["bitcoin", "btc"] },
    KeywordEntry { name: "monero", tier: None, terms: &["monero", "xmr"] },
    KeywordEntry { name: "ethereum", tier: None, terms: &["ethereum", "eth"] },
    KeywordEntry { name: "wallet", tier: None, terms: &["wallet", "wallets"] },
    KeywordEntry { name: "crypto", tier: None, terms: &["crypto", "cryptocurrency"] },
    KeywordEntry { name: "exchange", tier: None, terms: &["exchange"] },
    KeywordEntry { name: "mixer", tier: None, terms: &["mixer", "tumbler"] },
    KeywordEntry { name: "laundering", tier: None, terms: &["laundering", "launder"] },
    KeywordEntry { name: "malware", tier: None, terms: &["malware"] },
    KeywordEntry { name: "rootkit", tier: None, terms: &["rootkit"] },
    KeywordEntry { name: "vulnerability", tier: None, terms: &["vulnerability", "vulnerabilities"] },
    KeywordEntry { name: "leak", tier: None, terms: &["leak", "leaks", "leaked"] },
    KeywordEntry { name: "dump", tier: None, terms: &["dump", "dumps"] },
    KeywordEntry { name: "database", tier: None, terms: &["database"] },
    KeywordEntry { name: "credentials", tier: None, terms: &["credentials", "creds"] },
    KeywordEntry { name: "password", tier: None, terms: &["password", "passwords"] },
    KeywordEntry { name: "doxx", tier: None, terms: &["doxx", "dox"] },
    KeywordEntry { name: "scam", tier: None, terms: &["scam", "scams"] },
    KeywordEntry { name: "identity", tier: None, terms: &["identity"] },
    KeywordEntry { name: "cloned", tier: None, terms: &["cloned", "clone"] },
    KeywordEntry { name: "forum", tier: None, terms: &["forum", "forums"] },
    KeywordEntry { name: "chat", tier: None, terms: &["chat"] },
    KeywordEntry { name: "board", tier: None, terms: &["board"] },
    KeywordEntry { name: "community", tier: None, terms: &["community"] },
    KeywordEntry { name: "discussion", tier: None, terms: &["discussion"] },
    KeywordEntry { name: "messaging", tier: None, terms: &["messaging", "messenger"] },
    KeywordEntry { name: "wiki", tier: None, terms: &["wiki"] },
    KeywordEntry { name: "library", tier: None, terms: &["library"] },
    KeywordEntry { name: "archive", tier: None, terms: &["archive"] },
    KeywordEntry { name: "document", tier: None, terms: &["document", "documents"] },
    KeywordEntry { name: "guide", tier: None, terms: &["guide", "guides"] },
    KeywordEntry { name: "manual", tier: None, terms: &["manual"] },
    KeywordEntry { name: "adult", tier: None, terms: &["adult"] },
    KeywordEntry { name: "explicit", tier: None, terms: &["explicit"] },
];

/// A page category with its keyword set and weight. Category score is
/// `matches x weight`; best score wins, ties broken by higher weight then
/// lexicographic name.
pub struct Category {
    pub name: &'static str,
    pub weight: u32,
    pub keywords: &'static [&'static str],
}

pub const CATEGORIES: &[Category] = &[
    Category {
        name: "Illegal Marketplace",
        weight: 3,
        keywords: &["marketplace", "vendor", "escrow", "carding", "cvv", "drug", "weapon", "counterfeit", "shop"],
    },
    Category {
        name: "Hacking/Exploitation",
        weight: 3,
        keywords: &["hack", "exploit", "zero-day", "malware", "ransomware", "botnet", "ddos", "rootkit", "vulnerability"],
    },
    Category {
        name: "Data Leak",
        weight: 3,
        keywords: &["breach", "leak", "dump", "database", "credentials", "password", "doxx"],
    },
    Category {
        name: "Financial/Crypto",
        weight: 2,
        keywords: &["bitcoin", "monero", "ethereum", "wallet", "crypto", "exchange", "mixer", "laundering"],
    },
    Category {
        name: "Fraud",
        weight: 2,
        keywords: &["fraud", "scam", "phishing", "counterfeit", "identity", "cloned"],
    },
    Category {
        name: "Adult Content",
        weight: 2,
        keywords: &["adult", "explicit"],
    },
    Category {
        name: "Communication/Forum",
        weight: 1,
        keywords: &["forum", "chat", "board", "community", "discussion", "messaging"],
    },
    Category {
        name: "Document/Info",
        weight: 1,
        keywords: &["wiki", "library", "archive", "document", "guide", "manual"],
    },
];

pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// Lowercased alphanumeric tokens of length >= 3, deduplicated.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let lower = text.to_lowercase();
    let mut tokens = BTreeSet::new();
    let mut current = String::new();
    for ch in lower.chars() {
        if ch.is_alphanumeric() {
            current.push(ch);
        } else if !current.is_empty() {
            if current.chars().count() >= 3 {
                tokens.insert(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.chars().count() >= 3 {
        tokens.insert(current);
    }
    tokens
}

/// Match the curated dictionary against page text. Returns canonical keyword
/// names in dictionary order. Hyphenated terms match as substrings since the
/// tokenizer splits on the hyphen.
pub fn match_keywords(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let tokens = tokenize(&lower);
    let mut matched = Vec::new();
    for entry in DICTIONARY {
        let hit = entry.terms.iter().any(|term| {
            if term.chars().all(|c| c.is_alphanumeric()) {
                tokens.contains(*term)
            } else {
                lower.contains(term)
            }
        });
        if hit {
            matched.push(entry.name.to_string());
        }
    }
    matched
}

fn tier_of(keyword: &str) -> Option<Tier> {
    DICTIONARY
        .iter()
        .find(|e| e.name == keyword)
        .and_then(|e| e.tier)
}

/// Classification verdict for one page.
#[derive(Debug, Clone)]
pub struct ContentVerdict {
    pub threat_score: u8,
    pub risk_level: RiskLevel,
    pub category: String,
    pub confidence: f64,
    pub indicators: ThreatIndicators,
}

/// Pattern set and rule weights, compiled once.
pub struct ContentAnalyzer {
    email_re: Regex,
    btc_re: Regex,
    eth_re: Regex,
    xmr_re: Regex,
    scoring: ScoringWeights,
    confidence: ConfidenceWeights,
}

impl ContentAnalyzer {
    pub fn new(scoring: ScoringWeights, confidence: ConfidenceWeights) -> Self {
        Self {
            email_re: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
                .expect("email pattern"),
            // Non-capturing prefix group: find_iter must yield the whole
            // address, never just the bc1/1/3 prefix.
            btc_re: Regex::new(r"\b(?:bc1|[13])[a-zA-HJ-NP-Z0-9]{25,39}\b")
                .expect("bitcoin pattern"),
            eth_re: Regex::new(r"\b0x[a-fA-F0-9]{40}\b").expect("ethereum pattern"),
            xmr_re: Regex::new(r"\b4[0-9AB][1-9A-HJ-NP-Za-km-z]{93}\b").expect("monero pattern"),
            scoring,
            confidence,
        }
    }

    /// Extracted email addresses, lowercased, deduplicated, sorted.
    pub fn extract_emails(&self, text: &str) -> Vec<String> {
        let set: BTreeSet<String> = self
            .email_re
            .find_iter(text)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        set.into_iter().collect()
    }

    /// Extracted cryptocurrency addresses, deduplicated case-insensitively
    /// (first occurrence's casing kept), sorted.
    pub fn extract_crypto_addresses(&self, text: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for re in [&self.btc_re, &self.eth_re, &self.xmr_re] {
            for m in re.find_iter(text) {
                if seen.insert(m.as_str().to_lowercase()) {
                    out.push(m.as_str().to_string());
                }
            }
        }
        out.sort();
        out
    }

    /// Score and classify one page from its extracted signals.
    pub fn analyze(
        &self,
        keywords: &[String],
        emails: &[String],
        crypto_addresses: &[String],
        pgp_detected: bool,
        malware_detected: bool,
    ) -> ContentVerdict {
        let mut score: u32 = 0;

        for kw in keywords {
            score += match tier_of(kw) {
                Some(Tier::Critical) => self.scoring.critical_keyword,
                Some(Tier::High) => self.scoring.high_keyword,
                Some(Tier::Moderate) => self.scoring.moderate_keyword,
                None => 0,
            };
        }

        if !emails.is_empty() && !crypto_addresses.is_empty() {
            score += self.scoring.dual_indicator;
        }
        // Contact channel: email address or contact keyword, counted once.
        if !emails.is_empty() || keywords.iter().any(|k| k == "contact") {
            score += self.scoring.contact;
        }
        if malware_detected {
            score += self.scoring.malware;
        }
        if pgp_detected {
            score += self.scoring.pgp;
        }

        let threat_score = score.min(100) as u8;
        let (category, category_weight) = classify(keywords);
        let confidence = self.confidence_for(
            keywords.len(),
            emails.len(),
            crypto_addresses.len(),
            malware_detected,
            category_weight,
        );

        ContentVerdict {
            threat_score,
            risk_level: RiskLevel::from_score(threat_score),
            category,
            confidence,
            indicators: ThreatIndicators {
                keyword_matches: keywords.len() as u32,
                matched_keywords: keywords.to_vec(),
                crypto_detected: !crypto_addresses.is_empty(),
                email_detected: !emails.is_empty(),
                malware_detected,
            },
        }
    }

    fn confidence_for(
        &self,
        keyword_matches: usize,
        email_count: usize,
        crypto_count: usize,
        malware_detected: bool,
        category_weight: u32,
    ) -> f64 {
        let w = &self.confidence;
        if keyword_matches == 0 && email_count == 0 && crypto_count == 0 && !malware_detected {
            return w.floor;
        }
        let mut c = 0.0;
        c += (w.keyword_unit * keyword_matches as f64).min(w.keyword_cap);
        c += (w.crypto_unit * crypto_count as f64).min(w.crypto_cap);
        c += (w.email_unit * email_count as f64).min(w.email_cap);
        if malware_detected {
            c += w.malware;
        }
        c += (w.category_unit * category_weight as f64).min(w.category_cap);
        c.min(w.ceiling)
    }
}

impl Default for ContentAnalyzer {
    fn default() -> Self {
        Self::new(ScoringWeights::default(), ConfidenceWeights::default())
    }
}

/// Best-scoring category for a matched keyword set, with its weight.
/// Returns `Unknown` (weight 0) when nothing scores.
pub fn classify(keywords: &[String]) -> (String, u32) {
    let mut best: Option<(&Category, u32)> = None;
    for cat in CATEGORIES {
        let matches = cat
            .keywords
            .iter()
            .filter(|k| keywords.iter().any(|kw| kw == *k))
            .count() as u32;
        let score = matches * cat.weight;
        if score == 0 {
            continue;
        }
        best = match best {
            None => Some((cat, score)),
            Some((b, bs)) => {
                if score > bs
                    || (score == bs && cat.weight > b.weight)
                    || (score == bs && cat.weight == b.weight && cat.name < b.name)
                {
                    Some((cat, score))
                } else {
                    Some((b, bs))
                }
            }
        };
    }
    match best {
        Some((cat, _)) => (cat.name.to_string(), cat.weight),
        None => (UNKNOWN_CATEGORY.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKET_TEXT: &str =
        "Dark Market buy carding escrow contact: admin@shop.test BTC 1BoatSLRHtKNngkdXEeobR76b53LETtpyT";

    #[test]
    fn test_email_extraction_dedup() {
        let a = ContentAnalyzer::default();
        let emails = a.extract_emails("Admin@X.Test or admin@x.test, sales@x.test.");
        assert_eq!(emails, vec!["admin@x.test", "sales@x.test"]);
    }

    #[test]
    fn test_bitcoin_full_address_not_prefix() {
        let a = ContentAnalyzer::default();
        let addrs = a.extract_crypto_addresses("pay 1BoatSLRHtKNngkdXEeobR76b53LETtpyT now");
        assert_eq!(addrs, vec!["1BoatSLRHtKNngkdXEeobR76b53LETtpyT"]);
    }

    #[test]
    fn test_ethereum_and_monero_extraction() {
        let a = ContentAnalyzer::default();
        let eth = "0x52908400098527886E0F7030069857D2E4169EE7";
        // 95 chars: "4" + network byte + 93-char body.
        let xmr = format!("4{}{}", "AB", "9".repeat(92));
        let text = format!("send {} or {}", eth, xmr);
        let addrs = a.extract_crypto_addresses(&text);
        assert!(addrs.iter().any(|x| x == eth));
        assert!(addrs.iter().any(|x| x == &xmr));
    }

    #[test]
    fn test_monero_length_is_exact() {
        let a = ContentAnalyzer::default();
        let short = format!("4{}{}", "AB", "9".repeat(91)); // 94 chars
        let long = format!("4{}{}", "AB", "9".repeat(93)); // 96 chars
        assert!(a.extract_crypto_addresses(&short).is_empty());
        assert!(a.extract_crypto_addresses(&long).is_empty());
    }

    #[test]
    fn test_trailing_punctuation_is_word_bounded() {
        let a = ContentAnalyzer::default();
        let addrs = a.extract_crypto_addresses("wallet: 1BoatSLRHtKNngkdXEeobR76b53LETtpyT.");
        assert_eq!(addrs, vec!["1BoatSLRHtKNngkdXEeobR76b53LETtpyT"]);
    }

    #[test]
    fn test_keyword_canonicalisation() {
        let kws = match_keywords("visit our market for drugs");
        assert!(kws.iter().any(|k| k == "marketplace"));
        assert!(kws.iter().any(|k| k == "drug"));
    }

    #[test]
    fn test_marketplace_scenario_score() {
        let a = ContentAnalyzer::default();
        let keywords = match_keywords(MARKET_TEXT);
        let emails = a.extract_emails(MARKET_TEXT);
        let crypto = a.extract_crypto_addresses(MARKET_TEXT);
        assert!(keywords.iter().any(|k| k == "marketplace"));
        assert!(keywords.iter().any(|k| k == "carding"));
        assert!(keywords.iter().any(|k| k == "escrow"));
        assert_eq!(emails, vec!["admin@shop.test"]);
        assert_eq!(crypto, vec!["1BoatSLRHtKNngkdXEeobR76b53LETtpyT"]);

        let verdict = a.analyze(&keywords, &emails, &crypto, false, false);
        // market 8 + carding 15 + escrow 8 + dual 40 + contact 3
        assert_eq!(verdict.threat_score, 74);
        assert_eq!(verdict.risk_level, RiskLevel::High);
        assert_eq!(verdict.category, "Illegal Marketplace");
        // 0.40 (keywords, capped) + 0.15 (crypto) + 0.10 (email) + 0.15 (category, capped)
        assert!((verdict.confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_contact_signal_counted_once() {
        let a = ContentAnalyzer::default();
        // Keyword and email both present: the contact bonus fires once.
        let keywords = vec!["contact".to_string()];
        let v = a.analyze(&keywords, &["a@b.cc".to_string()], &[], false, false);
        assert_eq!(v.threat_score, 3);
        // Keyword alone.
        let v = a.analyze(&keywords, &[], &[], false, false);
        assert_eq!(v.threat_score, 3);
        // Email alone.
        let v = a.analyze(&[], &["a@b.cc".to_string()], &[], false, false);
        assert_eq!(v.threat_score, 3);
    }

    #[test]
    fn test_malware_and_pgp_bonuses() {
        let a = ContentAnalyzer::default();
        let v = a.analyze(&[], &[], &[], true, true);
        assert_eq!(v.threat_score, 27);
        assert!(v.indicators.malware_detected);
    }

    #[test]
    fn test_score_clamped_to_100() {
        let a = ContentAnalyzer::default();
        let keywords: Vec<String> = ["ransomware", "exploit", "carding", "cvv", "zero-day", "breach", "ddos", "botnet"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let v = a.analyze(
            &keywords,
            &["a@b.cc".to_string()],
            &["1BoatSLRHtKNngkdXEeobR76b53LETtpyT".to_string()],
            true,
            true,
        );
        assert_eq!(v.threat_score, 100);
        assert_eq!(v.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_no_signal_floor_confidence() {
        let a = ContentAnalyzer::default();
        let v = a.analyze(&[], &[], &[], false, false);
        assert_eq!(v.threat_score, 0);
        assert_eq!(v.category, UNKNOWN_CATEGORY);
        assert!((v.confidence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_classifier_deterministic() {
        let a = ContentAnalyzer::default();
        let keywords = match_keywords(MARKET_TEXT);
        let emails = a.extract_emails(MARKET_TEXT);
        let crypto = a.extract_crypto_addresses(MARKET_TEXT);
        let v1 = a.analyze(&keywords, &emails, &crypto, false, false);
        let v2 = a.analyze(&keywords, &emails, &crypto, false, false);
        assert_eq!(v1.category, v2.category);
        assert_eq!(v1.threat_score, v2.threat_score);
        assert!((v1.confidence - v2.confidence).abs() < 1e-12);
    }

    #[test]
    fn test_category_tiebreak_prefers_higher_weight() {
        // One forum keyword (weight 1) vs one financial keyword (weight 2):
        // financial scores higher outright.
        let (cat, w) = classify(&["forum".to_string(), "bitcoin".to_string()]);
        assert_eq!(cat, "Financial/Crypto");
        assert_eq!(w, 2);
    }
}

use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashSet;

type HmacSha256 = Hmac<Sha256>;

/// Pseudonym tokens carry this prefix so they can never be mistaken for
/// real data downstream.
const TOKEN_PREFIX: &str = "anon_";
/// Hex characters kept from the HMAC output; 16 hex chars = 64 bits, short
/// enough to read in logs, long enough to avoid collisions in practice.
const TOKEN_LEN: usize = 16;

const MASK_CHAR: char = '*';

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex")
});
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bhttps?://[^\s<>\)\]]+").expect("url regex"));
static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d{1,3}[-.\s]?\(?\d{2,4}\)?[-.\s]?\d{3,4}[-.\s]?\d{3,4}\b")
        .expect("phone regex")
});
static CARD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").expect("card regex")
});
static IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b")
        .expect("ip regex")
});
static CAPITALIZED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]{2,}\b").expect("capitalized-word regex"));
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9'_-]+").expect("word regex"));

/// Capitalized words that are sentence furniture, not names. A fixed list,
/// best-effort by design: the capitalized-token pass is a heuristic filter,
/// not a compliance guarantee.
static COMMON_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "The", "This", "That", "These", "Those", "There", "Then", "They", "Their", "And", "But",
        "For", "Not", "With", "From", "Into", "About", "After", "Before", "When", "Where",
        "While", "Which", "What", "Who", "Why", "How", "All", "Any", "Some", "Each", "Every",
        "Also", "Because", "Between", "Both", "During", "However", "Should", "Would", "Could",
        "Please", "Thanks", "Thank", "Regards", "Hello", "Dear", "Yes", "You", "Your", "Our",
        "His", "Her", "Its", "Was", "Were", "Are", "Has", "Have", "Had", "Will", "Can", "May",
        "Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday", "January",
        "February", "March", "April", "June", "July", "August", "September", "October",
        "November", "December",
    ]
    .into_iter()
    .collect()
});

/// Field names treated as sensitive by [`DataAnonymizer::anonymize_structured`]
/// in addition to whatever the caller passes. Substring match, case-folded.
const SENSITIVE_FIELD_HINTS: &[&str] = &[
    "name", "email", "phone", "address", "ssn", "social_security", "dob", "birth", "passport",
    "license", "ip_address", "user_agent", "password", "secret", "token", "account_number",
];

/// Pseudonymization and anonymization primitives. Stateless apart from the
/// keyed-hash salt; every method absorbs empty input to empty output instead
/// of erroring.
#[derive(Clone)]
pub struct DataAnonymizer {
    salt: String,
}

impl DataAnonymizer {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Deterministic one-way token for `value` within `namespace`. Same
    /// (value, namespace, salt) always yields the same token; the namespace
    /// is folded into the MAC so the same value pseudonymized for two
    /// different purposes cannot be correlated.
    pub fn pseudonymize(&self, value: &str, namespace: &str) -> String {
        if value.is_empty() {
            return String::new();
        }

        let mut mac = HmacSha256::new_from_slice(self.salt.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(namespace.as_bytes());
        mac.update(b":");
        mac.update(value.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());

        format!("{TOKEN_PREFIX}{}", &digest[..TOKEN_LEN])
    }

    /// Replace an email with a structurally similar, non-reversible one:
    /// first character of the local part survives, the rest is masked, the
    /// top-level domain is kept so the value still looks like an address.
    pub fn anonymize_email(&self, email: &str) -> String {
        if email.is_empty() {
            return String::new();
        }

        let (local, domain) = match email.split_once('@') {
            Some(parts) => parts,
            None => return self.mask(email, 0),
        };
        let first = local.chars().next().unwrap_or('x');
        let tld = domain.rsplit_once('.').map(|(_, tld)| tld).unwrap_or("com");

        format!("{first}***@***.{tld}")
    }

    /// Replace every digit with a random digit, keeping separators and
    /// country-code shape intact.
    pub fn anonymize_phone(&self, phone: &str) -> String {
        if phone.is_empty() {
            return String::new();
        }

        let mut rng = rand::thread_rng();
        phone
            .chars()
            .map(|c| {
                if c.is_ascii_digit() {
                    char::from(b'0' + rng.gen_range(0..10u8))
                } else {
                    c
                }
            })
            .collect()
    }

    /// Per-word masking that keeps initials and word lengths:
    /// "Jane Smith" becomes "J*** S****".
    pub fn anonymize_name(&self, name: &str) -> String {
        if name.is_empty() {
            return String::new();
        }

        name.split_whitespace()
            .map(mask_word)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Street-level scrubbing: digits become `X`, words are masked down to
    /// their initial. Keeps the line recognizable as an address and nothing
    /// else.
    pub fn anonymize_address(&self, address: &str) -> String {
        if address.is_empty() {
            return String::new();
        }

        address
            .split_whitespace()
            .map(|word| {
                if word.chars().any(|c| c.is_ascii_digit()) {
                    word.chars()
                        .map(|c| if c.is_ascii_digit() { 'X' } else { c })
                        .collect()
                } else {
                    mask_word(word)
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Rewrite PII embedded in free text: emails, URLs, card-shaped numbers,
    /// IP addresses, phone numbers, then capitalized tokens that are not
    /// common sentence words. With `preserve_length` each match is replaced
    /// by a same-length run of the mask character; otherwise by a bracketed
    /// tag. Heuristic name detection is best-effort, not a guarantee.
    pub fn anonymize_text(&self, text: &str, preserve_length: bool) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut out = text.to_string();
        out = replace_all(&EMAIL_RE, &out, "[EMAIL]", preserve_length);
        out = replace_all(&URL_RE, &out, "[URL]", preserve_length);
        out = replace_all(&CARD_RE, &out, "[CARD]", preserve_length);
        out = replace_all(&IP_RE, &out, "[IP]", preserve_length);
        out = replace_all(&PHONE_RE, &out, "[PHONE]", preserve_length);

        out = CAPITALIZED_RE
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                let word = &caps[0];
                if COMMON_WORDS.contains(word) {
                    word.to_string()
                } else if preserve_length {
                    MASK_CHAR.to_string().repeat(word.len())
                } else {
                    "[NAME]".to_string()
                }
            })
            .into_owned();

        out
    }

    /// Mask all but the last `visible_suffix` characters. Values no longer
    /// than the suffix come back untouched.
    pub fn mask(&self, value: &str, visible_suffix: usize) -> String {
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= visible_suffix {
            return value.to_string();
        }

        let masked = MASK_CHAR.to_string().repeat(chars.len() - visible_suffix);
        let suffix: String = chars[chars.len() - visible_suffix..].iter().collect();
        format!("{masked}{suffix}")
    }

    /// Replace every word with a positional placeholder carrying the word's
    /// length ("w1:5"), keeping punctuation and spacing. Preserves sentence
    /// shape for structural tests without preserving content.
    pub fn tokenize(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut position = 0usize;
        WORD_RE
            .replace_all(text, |caps: &regex::Captures<'_>| {
                position += 1;
                format!("w{position}:{}", caps[0].chars().count())
            })
            .into_owned()
    }

    /// Walk a nested JSON structure and anonymize every field whose name
    /// matches the sensitive-field heuristic or the caller's extra list.
    /// String values are routed by shape (email, phone, anything else);
    /// numbers are zeroed; nested maps and arrays are recursed into either
    /// way. Non-matching scalars pass through unchanged.
    pub fn anonymize_structured(&self, record: &Value, sensitive_fields: &[&str]) -> Value {
        match record {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    let anonymized = if value.is_object() || value.is_array() {
                        self.anonymize_structured(value, sensitive_fields)
                    } else if is_sensitive_field(key, sensitive_fields) {
                        self.anonymize_scalar(value)
                    } else {
                        value.clone()
                    };
                    out.insert(key.clone(), anonymized);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.anonymize_structured(item, sensitive_fields))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn anonymize_scalar(&self, value: &Value) -> Value {
        match value {
            Value::String(s) if s.is_empty() => Value::String(String::new()),
            Value::String(s) if EMAIL_RE.is_match(s) => Value::String(self.anonymize_email(s)),
            Value::String(s) if PHONE_RE.is_match(s) => Value::String(self.anonymize_phone(s)),
            Value::String(s) => Value::String(self.anonymize_name(s)),
            Value::Number(_) => Value::Number(0.into()),
            other => other.clone(),
        }
    }
}

fn mask_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let rest = chars.count();
            format!("{first}{}", MASK_CHAR.to_string().repeat(rest))
        }
        None => String::new(),
    }
}

fn replace_all(re: &Regex, text: &str, tag: &str, preserve_length: bool) -> String {
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        if preserve_length {
            MASK_CHAR.to_string().repeat(caps[0].chars().count())
        } else {
            tag.to_string()
        }
    })
    .into_owned()
}

fn is_sensitive_field(field: &str, extra: &[&str]) -> bool {
    let folded = field.to_ascii_lowercase();
    extra.iter().any(|f| folded.contains(&f.to_ascii_lowercase()))
        || SENSITIVE_FIELD_HINTS.iter().any(|hint| folded.contains(hint))
}

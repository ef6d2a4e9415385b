//! Normalisation: deterministic cleanup of extracted recipe text.
//!
//! Text-layer extraction and OCR both leave artefacts that confuse the
//! recipe parser downstream: ragged whitespace, words split across lines,
//! `l` read for `1`, decimal commas, and a dozen spellings of the same
//! section header. Every producer of raw text in the pipeline runs its
//! output through [`normalize`].
//!
//! ## Rule Order
//!
//! 1. Normalise line endings, strip invisible Unicode, expand ligatures
//! 2. Collapse horizontal whitespace and trim each line
//! 3. Collapse 3+ newlines to one blank line
//! 4. Repair digit and fraction OCR confusions
//! 5. Canonicalise section headers (`Ingredients:`, `Step 3:`)
//! 6. Rejoin words hyphenated across a line break
//! 7. Rejoin sentences broken by a stray newline
//! 8. Trim the whole text
//!
//! The rule set runs until the text stops changing, which makes
//! `normalize(normalize(x)) == normalize(x)` hold.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Upper bound on full passes; real input settles in one or two.
const MAX_PASSES: usize = 8;

/// Normalise raw extracted text. Pure, deterministic, idempotent.
pub fn normalize(text: &str) -> String {
    let mut current = normalize_once(text);
    for _ in 1..MAX_PASSES {
        let next = normalize_once(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn normalize_once(input: &str) -> String {
    let s = clean_characters(input);
    let s = collapse_whitespace(&s);
    let s = collapse_blank_lines(&s);
    let s = repair_digits(&s);
    let s = canonicalise_headers(&s);
    let s = rejoin_hyphenated(&s);
    let s = rejoin_sentences(&s);
    s.trim().to_string()
}

/// Apply `re` repeatedly until no match remains. Needed where a replacement
/// consumes the context the next match would start from (`a\nb\nc`).
fn replace_to_fixpoint(re: &Regex, input: &str, rep: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = re.replace_all(&current, rep).into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

// ── Rule 1: Characters ───────────────────────────────────────────────────────

fn clean_characters(input: &str) -> String {
    input
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace(
            [
                '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
            ],
            "",
        )
        .replace('\u{FB00}', "ff")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB03}', "ffi")
        .replace('\u{FB04}', "ffl")
}

// ── Rule 2: Horizontal whitespace ────────────────────────────────────────────

fn collapse_whitespace(input: &str) -> String {
    input
        .split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 3: Blank lines ──────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}

// ── Rule 4: Digit and fraction confusions ────────────────────────────────────
//
// `l`/`I`/`|` only become `1` when a digit follows, or (`l`/`I`) when squeezed
// between two digits. A trailing `l` after a number ("2l", "5lb") is a unit far more
// often than a misread digit, so it is left alone.

static RE_L_BEFORE_DIGIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(^|[^\p{L}\d|])[lI|]([\d/])").unwrap());
static RE_L_BETWEEN_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)[lI](\d)").unwrap());
static RE_O_AFTER_DIGIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(\d)([oO]+)([^\p{L}]|$)").unwrap());
static RE_DECIMAL_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)(\d),(\d{1,2})(\D|$)").unwrap());
static RE_DIGIT_LIST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:,\d+){2,}").unwrap());
static RE_SPACED_FRACTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d) ?/ ?(\d)").unwrap());

fn repair_digits(input: &str) -> String {
    let s = replace_to_fixpoint(&RE_L_BEFORE_DIGIT, input, "${1}1${2}");
    let s = replace_to_fixpoint(&RE_L_BETWEEN_DIGITS, &s, "${1}1${2}");
    let s = zero_letter_o(&s);
    let s = repair_decimal_commas(&s);
    RE_SPACED_FRACTION.replace_all(&s, "${1}/${2}").into_owned()
}

/// `O`/`o` runs glued to the end of a number and not followed by a letter:
/// `1O5`, `1OO g`, `18O°C`. `2oz` is left alone.
fn zero_letter_o(input: &str) -> String {
    let mut current = input.to_string();
    loop {
        let next = RE_O_AFTER_DIGIT
            .replace_all(&current, |caps: &Captures| {
                format!("{}{}{}", &caps[1], "0".repeat(caps[2].len()), &caps[3])
            })
            .into_owned();
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Decimal commas (`1,5 kg`) become points. Runs of three or more
/// comma-separated numbers (`steps 1,2,3`, `1,000,000`) are lists or
/// thousands groups and pass through untouched.
fn repair_decimal_commas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for list in RE_DIGIT_LIST.find_iter(input) {
        out.push_str(&replace_to_fixpoint(
            &RE_DECIMAL_COMMA,
            &input[last..list.start()],
            "${1}.${2}${3}",
        ));
        out.push_str(list.as_str());
        last = list.end();
    }
    out.push_str(&replace_to_fixpoint(
        &RE_DECIMAL_COMMA,
        &input[last..],
        "${1}.${2}${3}",
    ));
    out
}

// ── Rule 5: Section headers ──────────────────────────────────────────────────

static RE_SECTION_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^(?:#{1,6} ?)?(ingredients|instructions|directions|method|preparation|notes) ?:?$",
    )
    .unwrap()
});
static RE_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^step ?(\d+) ?[:.)\-]? ?(.*)$").unwrap());

fn canonicalise_headers(input: &str) -> String {
    let s = RE_SECTION_HEADER.replace_all(input, |caps: &Captures<'_>| {
        let word = caps[1].to_lowercase();
        let mut chars = word.chars();
        match chars.next() {
            Some(first) => format!("{}{}:", first.to_uppercase(), chars.as_str()),
            None => String::new(),
        }
    });
    RE_STEP
        .replace_all(&s, |caps: &Captures<'_>| {
            let n = caps[1].trim_start_matches('0');
            let n = if n.is_empty() { "0" } else { n };
            let rest = caps[2].trim();
            if rest.is_empty() {
                format!("Step {n}:")
            } else {
                format!("Step {n}: {rest}")
            }
        })
        .into_owned()
}

// ── Rule 6: Hyphenated line breaks ───────────────────────────────────────────

static RE_HYPHEN_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\p{L})-\n(\p{Ll})").unwrap());

fn rejoin_hyphenated(input: &str) -> String {
    replace_to_fixpoint(&RE_HYPHEN_BREAK, input, "${1}${2}")
}

// ── Rule 7: Broken sentences ─────────────────────────────────────────────────

static RE_BROKEN_SENTENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{Ll})\n(\p{Ll})").unwrap());

fn rejoin_sentences(input: &str) -> String {
    replace_to_fixpoint(&RE_BROKEN_SENTENCE, input, "${1} ${2}")
}

// ── Tests ────────────────────────────────────────────────────────────────────

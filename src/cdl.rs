//! CDL parsing & normalization (claims, expressions, legacy repair)
//!
//! The Condition Description Language (CDL) is the symbolic surface every
//! claim travels through: `Name(args)` predicates over point letters, plus
//! algebraic `Equal` forms over angle measures and segment lengths.
//!
//! ### Design highlights
//! - **One canonical tree.** `Equal` sides are lowered into an [`Expr`] tree
//!   (`Add`/`Mul`/`Measure`/`Length`/`Literal`/`Symbol`). Rendering a tree and
//!   re-parsing it yields the same tree, so normalization is idempotent and
//!   the equation store can key facts by their rendered form.
//! - **Reflection at construction.** `MeasureOfAngle(XYZ)` with `X > Z` is
//!   reversed on construction (`∠XYZ = ∠ZYX`); `LengthOfLine(BA)` becomes
//!   `LengthOfLine(AB)` (an undirected segment). Call sites never see the
//!   non-canonical spelling.
//! - **Items come from the raw spelling.** The `(predicate, item)` tuple keeps
//!   the student's letter order (`Equal(LengthOfLine(OA),LengthOfLine(OC))` ⇒
//!   `(O,A,O,C)`), because theorem parameters are derived from it.
//! - **Repair before rejection.** Legacy shorthand emitted by older upstream
//!   extractors (`ANGLE_MEASURE`, `EQUAL_LENGTH`, `COLLINEAR`, …) is rewritten
//!   to canonical predicates. `CYCLIC_QUADRILATERAL` needs a known circle
//!   centre; without one the claim is unparseable.
//!
//! Failed `Equal`-side parses are not errors at this layer: the claim still
//! parses to `predicate = "Equal"` with `expr = None`, and the step verifier
//! decides how generously to treat algebra it cannot lower.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

/// Errors surfaced by the CDL layer. These become `syntax_error` verdicts.
#[derive(Debug, thiserror::Error)]
pub enum CdlError {
    #[error("empty claim")]
    Empty,
    #[error("unbalanced brackets in `{0}`")]
    UnbalancedBrackets(String),
    #[error("claim is not of the form Name(args): `{0}`")]
    NotAPredicate(String),
    #[error("unexpected character `{0}`")]
    BadChar(char),
    #[error("bad numeric literal `{0}`")]
    BadNumber(String),
    #[error("{0} expects {1} point letters")]
    BadLetterCount(&'static str, usize),
    #[error("cyclic-quadrilateral rewrite needs a known circle centre")]
    MissingCircleCentre,
    #[error("shape segment `{0}` must be exactly two letters")]
    BadSegment(String),
    #[error("shape edges do not chain: `{0}` then `{1}`")]
    OpenShape(String, String),
    #[error("shape repeats edge `{0}`")]
    RepeatedEdge(String),
}

// ============================================================================
// Tokens
// ============================================================================

/// Lexical atoms of a CDL string.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Equals,
}

/// Tokenize a scrubbed CDL string.
pub fn tokenize(src: &str) -> Result<Vec<Token>, CdlError> {
    let mut toks = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                toks.push(Token::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Token::RParen);
            }
            ',' => {
                chars.next();
                toks.push(Token::Comma);
            }
            '+' => {
                chars.next();
                toks.push(Token::Plus);
            }
            '-' => {
                chars.next();
                toks.push(Token::Minus);
            }
            '*' => {
                chars.next();
                toks.push(Token::Star);
            }
            '/' => {
                chars.next();
                toks.push(Token::Slash);
            }
            '=' => {
                chars.next();
                toks.push(Token::Equals);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                toks.push(Token::Ident(ident));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v: f64 = num.parse().map_err(|_| CdlError::BadNumber(num.clone()))?;
                toks.push(Token::Number(v));
            }
            other => return Err(CdlError::BadChar(other)),
        }
    }
    Ok(toks)
}

// ============================================================================
// Expression trees
// ============================================================================

/// One side of an algebraic claim, in canonical tree form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Left-folded sum: `a+b+c` parses as `Add(Add(a,b),c)`.
    Add(Box<Expr>, Box<Expr>),
    /// Scalar product, `Mul(2, MeasureOfAngle(ABC))`.
    Mul(Box<Expr>, Box<Expr>),
    /// `MeasureOfAngle(XYZ)`, stored with first/last letters ascending.
    Measure([char; 3]),
    /// `LengthOfLine(AB)`, stored with letters ascending (undirected segment).
    Length([char; 2]),
    /// Numeric literal.
    Literal(f64),
    /// Free symbol, e.g. `x`.
    Symbol(String),
}

impl Expr {
    /// Canonical angle-measure atom. Reverses `XYZ` when `X > Z`.
    pub fn measure(a: char, v: char, b: char) -> Expr {
        if a > b {
            Expr::Measure([b, v, a])
        } else {
            Expr::Measure([a, v, b])
        }
    }

    /// Canonical segment-length atom. Sorts the two letters.
    pub fn length(a: char, b: char) -> Expr {
        if a > b {
            Expr::Length([b, a])
        } else {
            Expr::Length([a, b])
        }
    }

    /// Render the canonical CDL spelling of this tree.
    pub fn render(&self) -> String {
        match self {
            Expr::Add(a, b) => format!("Add({},{})", a.render(), b.render()),
            Expr::Mul(a, b) => format!("Mul({},{})", a.render(), b.render()),
            Expr::Measure(p) => format!("MeasureOfAngle({}{}{})", p[0], p[1], p[2]),
            Expr::Length(p) => format!("LengthOfLine({}{})", p[0], p[1]),
            Expr::Literal(v) => render_number(*v),
            Expr::Symbol(s) => s.clone(),
        }
    }

    /// Collect the atoms (measures, lengths, symbols) of this tree in order.
    pub fn atoms<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match self {
            Expr::Add(a, b) | Expr::Mul(a, b) => {
                a.atoms(out);
                b.atoms(out);
            }
            Expr::Literal(_) => {}
            _ => out.push(self),
        }
    }
}

/// An `Equal(lhs,rhs)` root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Equation {
    pub lhs: Expr,
    pub rhs: Expr,
}

impl Equation {
    pub fn new(lhs: Expr, rhs: Expr) -> Self {
        Self { lhs, rhs }
    }

    /// Render in claim orientation.
    pub fn render(&self) -> String {
        format!("Equal({},{})", self.lhs.render(), self.rhs.render())
    }

    /// Orientation-independent store key: `Equal(a,b)` and `Equal(b,a)` are
    /// the same constraint.
    pub fn key(&self) -> String {
        let fwd = self.render();
        let rev = format!("Equal({},{})", self.rhs.render(), self.lhs.render());
        if fwd <= rev {
            fwd
        } else {
            rev
        }
    }
}

fn render_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

// ============================================================================
// Claims
// ============================================================================

/// The parsed form of one step: `(predicate, item)` plus, for `Equal` claims,
/// the lowered expression tree (`None` when the algebra would not lower).
#[derive(Clone, Debug, PartialEq)]
pub struct Claim {
    /// `S{step}C{index}`.
    pub claim_id: String,
    pub predicate: String,
    /// Ordered point letters in the student's spelling.
    pub item: Vec<char>,
    pub expr: Option<Equation>,
}

/// Normalize then parse a claim string.
///
/// `centre_hint` feeds the `CYCLIC_QUADRILATERAL` repair; pass the letter from
/// an `IsCentreOfCircle(P,P)` given when one exists.
pub fn parse_claim(
    claim_cdl: &str,
    step_id: u32,
    index: usize,
    centre_hint: Option<char>,
) -> Result<Claim, CdlError> {
    // Scrub + repair + equals-rewrite only; the item tuple must keep the
    // student's letter order, so no canonical re-render happens here.
    let scrubbed = scrub(claim_cdl);
    if scrubbed.is_empty() {
        return Err(CdlError::Empty);
    }
    let repaired = repair(&scrubbed, centre_hint)?;
    let text = rewrite_equals(&repaired);
    let toks = tokenize(&text)?;
    let (predicate, args) = split_outer(&toks, &text)?;

    let expr = if predicate == "Equal" {
        parse_equation_args(&args).ok()
    } else {
        None
    };

    Ok(Claim {
        claim_id: format!("S{step_id}C{index}"),
        predicate,
        item: extract_points(&args),
        expr,
    })
}

/// Normalize a raw CDL string into its canonical spelling. Idempotent.
///
/// Pipeline (spec order): scrub notation (`°`, `∠`, `m∠`), repair legacy
/// shorthand, rewrite `lhs = rhs` into `Equal(lhs,rhs)`, and re-render
/// parseable `Equal` trees canonically.
pub fn normalize(raw: &str, centre_hint: Option<char>) -> Result<String, CdlError> {
    let scrubbed = scrub(raw);
    if scrubbed.is_empty() {
        return Err(CdlError::Empty);
    }
    let repaired = repair(&scrubbed, centre_hint)?;
    let text = rewrite_equals(&repaired);

    // Canonical re-render for Equal claims whose sides lower cleanly.
    if text.starts_with("Equal(") {
        let toks = tokenize(&text)?;
        let (_, args) = split_outer(&toks, &text)?;
        if let Ok(eq) = parse_equation_args(&args) {
            return Ok(eq.render());
        }
    }
    Ok(text)
}

/// Strip degree symbols and angle/measure prefixes.
fn scrub(raw: &str) -> String {
    raw.replace("m∠", "")
        .replace('∠', "")
        .replace('°', "")
        .trim()
        .to_string()
}

/// `lhs = rhs` outside `Equal(…)` becomes `Equal(lhs,rhs)`.
fn rewrite_equals(text: &str) -> String {
    if text.starts_with("Equal(") || !text.contains('=') {
        return text.to_string();
    }
    match text.split_once('=') {
        Some((l, r)) if !l.trim().is_empty() && !r.trim().is_empty() => {
            format!("Equal({},{})", l.trim(), r.trim())
        }
        _ => text.to_string(),
    }
}

/// Split `Name(a,b,…)` into the predicate name and its raw top-level argument
/// strings, without any lowering. Construction loading uses this to keep the
/// segment structure of `Shape(AB,BC,CA)`.
pub fn split_predicate(text: &str) -> Result<(String, Vec<String>), CdlError> {
    let trimmed = text.trim();
    let (name, rest) = trimmed
        .split_once('(')
        .ok_or_else(|| CdlError::NotAPredicate(trimmed.to_string()))?;
    let inner = rest
        .strip_suffix(')')
        .ok_or_else(|| CdlError::UnbalancedBrackets(trimmed.to_string()))?;
    if name.trim().is_empty() || inner.trim().is_empty() {
        return Err(CdlError::NotAPredicate(trimmed.to_string()));
    }
    Ok((
        name.trim().to_string(),
        split_top_level(inner, ',')
            .into_iter()
            .map(|s| s.trim().to_string())
            .collect(),
    ))
}

// ============================================================================
// Legacy repair
// ============================================================================

/// Rewrite legacy shorthand predicates to canonical CDL.
///
/// Unrecognized spellings pass through untouched; only the cyclic
/// quadrilateral form can fail outright (it needs a circle centre).
pub fn repair(text: &str, centre_hint: Option<char>) -> Result<String, CdlError> {
    let (name, inner) = match text.split_once('(') {
        Some((n, rest)) if rest.ends_with(')') => (n.trim(), &rest[..rest.len() - 1]),
        _ => return Ok(text.to_string()),
    };
    let args: Vec<String> = split_top_level(inner, ',')
        .into_iter()
        .map(|s| s.trim().to_string())
        .collect();

    let upper = name.to_ascii_uppercase();
    let out = match upper.as_str() {
        "COLLINEAR" if name != "Collinear" => {
            let letters: String = args.join("").chars().filter(|c| c.is_ascii_alphabetic()).collect();
            format!("Collinear({})", letters.to_ascii_uppercase())
        }
        "CYCLIC_QUADRILATERAL" => {
            let quad: String = args.join("").chars().filter(|c| c.is_ascii_alphabetic()).collect();
            match centre_hint {
                Some(c) if quad.len() == 4 => format!("Cocircular({c},{})", quad.to_ascii_uppercase()),
                _ => return Err(CdlError::MissingCircleCentre),
            }
        }
        "EQUAL_ANGLE" if args.len() == 2 => format!(
            "Equal(MeasureOfAngle({}),MeasureOfAngle({}))",
            args[0], args[1]
        ),
        "EQUAL_LENGTH" if args.len() == 2 => format!(
            "Equal(LengthOfLine({}),LengthOfLine({}))",
            args[0], args[1]
        ),
        "ANGLE_MEASURE" if args.len() == 2 => {
            format!("Equal(MeasureOfAngle({}),{})", args[0], args[1])
        }
        "ANGLE_MEASURE_RELATION" | "ANGLE_RELATION" if args.len() == 2 => {
            // ANGLE_MEASURE_RELATION(BOD,2*BAD) → Equal(MeasureOfAngle(BOD),2*MeasureOfAngle(BAD))
            let rhs = match args[1].split_once('*') {
                Some((k, ang)) => format!("{}*MeasureOfAngle({})", k.trim(), ang.trim()),
                None => args[1].clone(),
            };
            format!("Equal(MeasureOfAngle({}),{rhs})", args[0])
        }
        "RIGHT_ANGLE" if args.len() == 1 => {
            format!("Equal(MeasureOfAngle({}),90)", args[0])
        }
        _ => text.to_string(),
    };
    Ok(out)
}

// ============================================================================
// Parsing internals
// ============================================================================

/// Split `Name(args)` at the outermost level, checking bracket balance.
fn split_outer(toks: &[Token], text: &str) -> Result<(String, Vec<Token>), CdlError> {
    let mut depth = 0i32;
    for t in toks {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => {
                depth -= 1;
                if depth < 0 {
                    return Err(CdlError::UnbalancedBrackets(text.to_string()));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(CdlError::UnbalancedBrackets(text.to_string()));
    }
    match toks {
        [Token::Ident(name), Token::LParen, mid @ .., Token::RParen] if !mid.is_empty() => {
            Ok((name.clone(), mid.to_vec()))
        }
        _ => Err(CdlError::NotAPredicate(text.to_string())),
    }
}

/// Ordered point letters from the argument tokens: every all-uppercase ident
/// that is *not* a function call, flattened letter by letter.
fn extract_points(args: &[Token]) -> Vec<char> {
    let mut points = Vec::new();
    for (i, t) in args.iter().enumerate() {
        if let Token::Ident(name) = t {
            let is_call = matches!(args.get(i + 1), Some(Token::LParen));
            if !is_call && name.chars().all(|c| c.is_ascii_uppercase()) {
                points.extend(name.chars());
            }
        }
    }
    points
}

/// Parse a standalone expression from tokens (used for `Value(expr)` goals).
pub fn parse_expression(toks: &[Token]) -> Result<Expr, CdlError> {
    parse_side(toks)
}

/// Parse the two comma-separated sides of an `Equal`.
fn parse_equation_args(args: &[Token]) -> Result<Equation, CdlError> {
    let sides = split_tokens_top_level(args, &Token::Comma);
    if sides.len() != 2 {
        return Err(CdlError::NotAPredicate("Equal".into()));
    }
    Ok(Equation::new(parse_side(sides[0])?, parse_side(sides[1])?))
}

/// Parse one side: `term ('+' term)*`, left-folded into `Add`.
fn parse_side(toks: &[Token]) -> Result<Expr, CdlError> {
    let terms = split_tokens_top_level(toks, &Token::Plus);
    let mut acc: Option<Expr> = None;
    for term in terms {
        let e = parse_term(term)?;
        acc = Some(match acc {
            None => e,
            Some(a) => Expr::Add(Box::new(a), Box::new(e)),
        });
    }
    acc.ok_or(CdlError::Empty)
}

/// Parse one term: `factor ('*' factor)*`, left-folded into `Mul`.
fn parse_term(toks: &[Token]) -> Result<Expr, CdlError> {
    let factors = split_tokens_top_level(toks, &Token::Star);
    let mut acc: Option<Expr> = None;
    for f in factors {
        let e = parse_factor(f)?;
        acc = Some(match acc {
            None => e,
            Some(a) => Expr::Mul(Box::new(a), Box::new(e)),
        });
    }
    acc.ok_or(CdlError::Empty)
}

fn parse_factor(toks: &[Token]) -> Result<Expr, CdlError> {
    match toks {
        [Token::Number(v)] => Ok(Expr::Literal(*v)),
        [Token::Ident(name)] => Ok(Expr::Symbol(name.clone())),
        [Token::Ident(name), Token::LParen, mid @ .., Token::RParen] => match name.as_str() {
            "MeasureOfAngle" => {
                let p = ident_letters(mid).ok_or(CdlError::BadLetterCount("MeasureOfAngle", 3))?;
                if p.len() != 3 {
                    return Err(CdlError::BadLetterCount("MeasureOfAngle", 3));
                }
                Ok(Expr::measure(p[0], p[1], p[2]))
            }
            "LengthOfLine" => {
                let p = ident_letters(mid).ok_or(CdlError::BadLetterCount("LengthOfLine", 2))?;
                if p.len() != 2 {
                    return Err(CdlError::BadLetterCount("LengthOfLine", 2));
                }
                Ok(Expr::length(p[0], p[1]))
            }
            // Canonical renderings re-parse, keeping normalization idempotent.
            "Add" | "Mul" => {
                let halves = split_tokens_top_level(mid, &Token::Comma);
                if halves.len() != 2 {
                    return Err(CdlError::NotAPredicate(name.clone()));
                }
                let a = Box::new(parse_side(halves[0])?);
                let b = Box::new(parse_side(halves[1])?);
                Ok(if name == "Add" {
                    Expr::Add(a, b)
                } else {
                    Expr::Mul(a, b)
                })
            }
            other => Err(CdlError::NotAPredicate(other.to_string())),
        },
        _ => Err(CdlError::NotAPredicate(render_tokens(toks))),
    }
}

/// Single bare ident inside a call, split into letters (`ABC` ⇒ `[A,B,C]`).
fn ident_letters(toks: &[Token]) -> Option<Vec<char>> {
    match toks {
        [Token::Ident(s)] if s.chars().all(|c| c.is_ascii_uppercase()) => {
            Some(s.chars().collect())
        }
        _ => None,
    }
}

/// Split a token slice at `sep` occurrences outside any parentheses.
fn split_tokens_top_level<'a>(toks: &'a [Token], sep: &Token) -> Vec<&'a [Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, t) in toks.iter().enumerate() {
        match t {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            t if t == sep && depth == 0 => {
                parts.push(&toks[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&toks[start..]);
    parts
}

/// Split a string at `sep` outside parentheses (used by the repair pass,
/// which runs before tokenization).
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut cur = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth -= 1;
                cur.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    parts.push(cur);
    parts
}

fn render_tokens(toks: &[Token]) -> String {
    let mut out = String::new();
    for t in toks {
        match t {
            Token::Ident(s) => out.push_str(s),
            Token::Number(v) => out.push_str(&render_number(*v)),
            Token::LParen => out.push('('),
            Token::RParen => out.push(')'),
            Token::Comma => out.push(','),
            Token::Plus => out.push('+'),
            Token::Minus => out.push('-'),
            Token::Star => out.push('*'),
            Token::Slash => out.push('/'),
            Token::Equals => out.push('='),
        }
    }
    out
}

// ============================================================================
// Shape admission
// ============================================================================

/// Check the shape admission rule: each segment is exactly two letters,
/// consecutive segments chain (`s[i][1] == s[i+1 mod k][0]`), and no
/// undirected edge repeats.
pub fn validate_shape(segments: &[&str]) -> Result<(), CdlError> {
    let mut edges: Vec<(char, char)> = Vec::with_capacity(segments.len());
    for seg in segments {
        let letters: Vec<char> = seg.chars().collect();
        if letters.len() != 2 || !letters.iter().all(|c| c.is_ascii_uppercase()) {
            return Err(CdlError::BadSegment(seg.to_string()));
        }
        let (a, b) = (letters[0], letters[1]);
        let und = if a < b { (a, b) } else { (b, a) };
        if edges.contains(&und) {
            return Err(CdlError::RepeatedEdge(seg.to_string()));
        }
        edges.push(und);
    }
    for (i, seg) in segments.iter().enumerate() {
        let next = segments[(i + 1) % segments.len()];
        let tail = seg.chars().nth(1);
        let head = next.chars().next();
        if tail != head {
            return Err(CdlError::OpenShape(seg.to_string(), next.to_string()));
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

//! Theorem engine: problem loading, theorem application, goal checking
//!
//! The step verifier talks to deduction through the [`TheoremEngine`] trait —
//! the seam behind which a full deductive solver could sit. Two
//! implementations ship in-crate:
//!
//! - [`DeductiveEngine`]: seeds the KB from a [`ProblemSpec`](crate::ProblemSpec),
//!   applies a registry of named theorems by exhaustive match, and checks
//!   goals against the equation system. Deterministic given KB state and
//!   inputs.
//! - [`MinimalEngine`]: the degraded adapter — same seeding, no theorems,
//!   `check_goal` always `Unproved`. `Equal` claims still reach the equation
//!   sub-store and everything else rides the assumption paths, so the rest of
//!   the core is unchanged.
//!
//! Theorem application never mutates on failure: the *caller* snapshots
//! before a speculative application and restores when the attempt fails or
//! the claimed conclusion does not materialize.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use tracing::{debug, info};

use crate::cdl::{self, CdlError, Equation, Expr};
use crate::kb::{FactId, Item, KbError, KnowledgeBase, TheoremTag};
use crate::ProblemSpec;

/// Tolerance when comparing a resolved goal value to the expected answer.
const ANSWER_EPS: f64 = 1e-6;

/// Predicate families the engine understands out of the box. Anything else
/// enters the KB only through `ensure_predicate_slot` (assumption path).
pub const VOCABULARY: &[&str] = &[
    "Shape",
    "Collinear",
    "Cocircular",
    "Line",
    "Angle",
    "Triangle",
    "IsoscelesTriangle",
    "RightTriangle",
    "Kite",
    "Quadrilateral",
    "ParallelBetweenLine",
    "PerpendicularBetweenLine",
    "CongruentBetweenTriangle",
    "IsCentreOfCircle",
    "IsDiameterOfCircle",
    "IsTangentOfCircle",
    "MeasureOfAngle",
    "LengthOfLine",
    "Equation",
];

/// Canonical theorem names the built-in engine can discharge.
pub const THEOREMS: &[&str] = &[
    "circle_property_radius_equal",
    "isosceles_triangle_judgment_two_sides_equal",
    "isosceles_triangle_property_angle_equal",
    "triangle_property_angle_sum",
    "diameter_of_circle_property_right_angle",
    "right_triangle_judgment_angle",
    "congruent_triangle_property_line_equal",
    "congruent_triangle_property_angle_equal",
];

/// Outcome of the final goal check.
#[derive(Clone, Debug, PartialEq)]
pub enum GoalStatus {
    Proved,
    ProvedWithAnswer(f64),
    Unproved,
}

impl GoalStatus {
    #[inline]
    pub fn reached(&self) -> bool {
        !matches!(self, GoalStatus::Unproved)
    }
}

/// New facts produced by one theorem application.
#[derive(Clone, Debug, Default)]
pub struct Update {
    pub added: Vec<FactId>,
}

/// Parsed goal form.
#[derive(Clone, Debug)]
pub enum Goal {
    Value(Expr),
    Equal(Equation),
}

/// Infrastructure failures while ingesting a [`ProblemSpec`]. These degrade
/// the whole grade call (spec-level, not step-level).
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("problem CDL failed to parse: {0}")]
    Cdl(#[from] CdlError),
    #[error("knowledge base rejected a given: {0}")]
    Kb(#[from] KbError),
    #[error("unknown predicate `{0}` in problem statement")]
    UnknownPredicate(String),
    #[error("given `{0}` does not lower to an equation")]
    BadGiven(String),
    #[error("goal `{0}` is neither Value(…) nor Equal(…)")]
    BadGoal(String),
}

/// The deduction seam. One engine instance is scoped to one grade call.
pub trait TheoremEngine {
    /// Ingest the problem: populate the KB with all base facts and parse the
    /// goal. Must be called exactly once, before any verification.
    fn load(&mut self, spec: &ProblemSpec) -> Result<(), InitError>;

    fn kb(&self) -> &KnowledgeBase;
    fn kb_mut(&mut self) -> &mut KnowledgeBase;

    /// Canonical names the matcher may resolve to.
    fn theorem_names(&self) -> &'static [&'static str];

    /// Circle centre letter, when the problem declares one. Feeds the
    /// cyclic-quadrilateral repair.
    fn centre_hint(&self) -> Option<char> {
        None
    }

    /// Attempt one theorem with a flattened point-parameter tuple. `None`
    /// when preconditions are unmet; `Some` carries whatever facts were newly
    /// produced (possibly nothing, when all consequences were already known).
    fn apply_theorem(&mut self, name: &str, params: &[char]) -> Option<Update>;

    /// Pure function of the final KB and the loaded goal.
    fn check_goal(&self) -> GoalStatus;
}

// ============================================================================
// Shared problem seeding
// ============================================================================

struct LoadedProblem {
    centre: Option<char>,
    goal: Goal,
    expected_answer: Option<f64>,
}

/// Parse constructions, givens, and the goal into a fresh KB.
fn load_problem(kb: &mut KnowledgeBase, spec: &ProblemSpec) -> Result<LoadedProblem, InitError> {
    for p in VOCABULARY {
        kb.ensure_predicate_slot(p);
    }

    // Centre first: later givens and claim repair both want it.
    let centre = infer_centre(spec);

    for text in &spec.construction_cdl {
        let (name, args) = cdl::split_predicate(text)?;
        match name.as_str() {
            "Shape" => {
                let segs: Vec<&str> = args.iter().map(String::as_str).collect();
                cdl::validate_shape(&segs)?;
                let corners: Vec<char> = segs.iter().filter_map(|s| s.chars().next()).collect();
                kb.add("Shape", &corners, &[], TheoremTag::Given)?;
                for seg in &segs {
                    let mut pts: Vec<char> = seg.chars().collect();
                    pts.sort_unstable();
                    kb.add("Line", &pts, &[], TheoremTag::Given)?;
                }
                match corners.len() {
                    3 => {
                        kb.add("Triangle", &corners, &[], TheoremTag::Given)?;
                    }
                    4 => {
                        kb.add("Quadrilateral", &corners, &[], TheoremTag::Given)?;
                    }
                    _ => {}
                }
            }
            "Collinear" | "Cocircular" => {
                let points: Vec<char> = args
                    .join("")
                    .chars()
                    .filter(|c| c.is_ascii_uppercase())
                    .collect();
                kb.add(&name, &points, &[], TheoremTag::Given)?;
            }
            other => return Err(InitError::UnknownPredicate(other.to_string())),
        }
    }

    for (i, text) in spec.text_cdl.iter().enumerate() {
        let claim = cdl::parse_claim(text, 0, i + 1, centre)?;
        if claim.predicate == "Equal" {
            let eq = claim
                .expr
                .ok_or_else(|| InitError::BadGiven(text.clone()))?;
            kb.add_equation(&eq, &[], TheoremTag::Given)?;
        } else {
            if !kb.knows_predicate(&claim.predicate) {
                return Err(InitError::UnknownPredicate(claim.predicate));
            }
            kb.add(&claim.predicate, &claim.item, &[], TheoremTag::Given)?;
        }
    }

    let goal = parse_goal(&spec.goal_cdl)?;
    let expected_answer = spec
        .problem_answer
        .as_deref()
        .and_then(|a| a.trim().parse::<f64>().ok());

    info!(
        facts = kb.len(),
        equations = kb.equations().len(),
        ?centre,
        "problem loaded"
    );
    Ok(LoadedProblem { centre, goal, expected_answer })
}

/// `IsCentreOfCircle(P,P)` in the givens names the circle centre; failing
/// that, the first letter of a `Cocircular` construction does.
fn infer_centre(spec: &ProblemSpec) -> Option<char> {
    for text in &spec.text_cdl {
        if let Ok((name, args)) = cdl::split_predicate(text) {
            if name == "IsCentreOfCircle" && args.len() == 2 && args[0] == args[1] {
                let mut chars = args[0].chars();
                if let (Some(c), None) = (chars.next(), chars.next()) {
                    if c.is_ascii_uppercase() {
                        return Some(c);
                    }
                }
            }
        }
    }
    for text in &spec.construction_cdl {
        if let Ok((name, args)) = cdl::split_predicate(text) {
            if name == "Cocircular" {
                if let Some(c) = args.first().and_then(|a| a.chars().next()) {
                    if c.is_ascii_uppercase() {
                        return Some(c);
                    }
                }
            }
        }
    }
    None
}

fn parse_goal(goal_cdl: &str) -> Result<Goal, InitError> {
    let (name, _) = cdl::split_predicate(goal_cdl)?;
    match name.as_str() {
        "Value" => {
            let inner = goal_cdl
                .trim()
                .strip_prefix("Value(")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| InitError::BadGoal(goal_cdl.to_string()))?;
            let toks = cdl::tokenize(inner)?;
            let expr = cdl::parse_expression(&toks)
                .map_err(|_| InitError::BadGoal(goal_cdl.to_string()))?;
            Ok(Goal::Value(expr))
        }
        "Equal" => {
            let claim = cdl::parse_claim(goal_cdl, 0, 0, None)?;
            let eq = claim
                .expr
                .ok_or_else(|| InitError::BadGoal(goal_cdl.to_string()))?;
            Ok(Goal::Equal(eq))
        }
        _ => Err(InitError::BadGoal(goal_cdl.to_string())),
    }
}

// ============================================================================
// Built-in deductive engine
// ============================================================================

/// Built-in deterministic solver over the theorem registry.
#[derive(Debug, Default)]
pub struct DeductiveEngine {
    kb: KnowledgeBase,
    goal: Option<Goal>,
    expected_answer: Option<f64>,
    centre: Option<char>,
}

impl DeductiveEngine {
    pub fn new() -> Self {
        Self { kb: KnowledgeBase::new(), ..Self::default() }
    }

    // ----------------------------- Theorems ------------------------------

    /// All radii of one circle are equal: pairwise length equations for the
    /// cocircular points of the centre named in `params`.
    fn radius_equal(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let centre = params.iter().copied().find(|c| {
            self.kb
                .items_of("Cocircular")
                .iter()
                .any(|f| matches!(&f.item, Item::Points(p) if p.first() == Some(c)))
        })?;

        let circles: Vec<(FactId, Vec<char>)> = self
            .kb
            .items_of("Cocircular")
            .into_iter()
            .filter_map(|f| match &f.item {
                Item::Points(p) if p.first() == Some(&centre) && p.len() >= 3 => {
                    Some((f.id, p[1..].to_vec()))
                }
                _ => None,
            })
            .collect();
        if circles.is_empty() {
            return None;
        }

        let mut added = Vec::new();
        for (premise, pts) in circles {
            for i in 0..pts.len() {
                for j in i + 1..pts.len() {
                    let eq = Equation::new(
                        Expr::length(centre, pts[i]),
                        Expr::length(centre, pts[j]),
                    );
                    self.push_equation(&eq, &[premise], "circle_property_radius_equal", params, &mut added);
                }
            }
        }
        Some(added)
    }

    /// Two equal sides at the middle vertex make the triangle isosceles.
    fn isosceles_judgment(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let [a, v, b] = three(params)?;
        let legs = Equation::new(Expr::length(a, v), Expr::length(v, b));
        if !self.kb.entails(&legs) {
            return None;
        }
        let premises = self.equation_id(&legs).into_iter().collect::<Vec<_>>();
        let mut added = Vec::new();
        self.push_fact("Triangle", &[a, v, b], &premises, "isosceles_triangle_judgment_two_sides_equal", params, &mut added);
        self.push_fact("IsoscelesTriangle", &[a, v, b], &premises, "isosceles_triangle_judgment_two_sides_equal", params, &mut added);
        Some(added)
    }

    /// Base angles of an isosceles triangle are equal (apex at the middle
    /// letter).
    fn isosceles_base_angles(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let [a, v, b] = three(params)?;
        let fact = self
            .kb
            .id_of("IsoscelesTriangle", &Item::Points(vec![a, v, b]))
            .or_else(|| self.kb.id_of("IsoscelesTriangle", &Item::Points(vec![b, v, a])))?;
        let eq = Equation::new(Expr::measure(v, a, b), Expr::measure(v, b, a));
        let mut added = Vec::new();
        self.push_equation(&eq, &[fact], "isosceles_triangle_property_angle_equal", params, &mut added);
        Some(added)
    }

    /// Interior angles of a triangle sum to 180.
    fn angle_sum(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let [a, b, c] = three(params)?;
        let fact = self.triangle_id_any_order(a, b, c)?;
        let sum = Expr::Add(
            Box::new(Expr::Add(
                Box::new(Expr::measure(a, b, c)),
                Box::new(Expr::measure(b, c, a)),
            )),
            Box::new(Expr::measure(c, a, b)),
        );
        let eq = Equation::new(sum, Expr::Literal(180.0));
        let mut added = Vec::new();
        self.push_equation(&eq, &[fact], "triangle_property_angle_sum", params, &mut added);
        Some(added)
    }

    /// An angle inscribed in a semicircle is right: for every declared
    /// diameter, every other cocircular point subtends 90°.
    fn semicircle_right_angle(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let diameters: Vec<(FactId, char, char, char)> = self
            .kb
            .items_of("IsDiameterOfCircle")
            .into_iter()
            .filter_map(|f| match &f.item {
                Item::Points(p) if p.len() == 3 => Some((f.id, p[0], p[1], p[2])),
                _ => None,
            })
            .collect();
        if diameters.is_empty() {
            return None;
        }

        let mut added = Vec::new();
        let mut applicable = false;
        for (diam_id, a, b, circle) in diameters {
            let circles: Vec<(FactId, Vec<char>)> = self
                .kb
                .items_of("Cocircular")
                .into_iter()
                .filter_map(|f| match &f.item {
                    Item::Points(p) if p.first() == Some(&circle) => Some((f.id, p[1..].to_vec())),
                    _ => None,
                })
                .collect();
            for (circ_id, pts) in circles {
                for z in pts.into_iter().filter(|z| *z != a && *z != b) {
                    applicable = true;
                    let eq = Equation::new(Expr::measure(a, z, b), Expr::Literal(90.0));
                    self.push_equation(
                        &eq,
                        &[diam_id, circ_id],
                        "diameter_of_circle_property_right_angle",
                        params,
                        &mut added,
                    );
                }
            }
        }
        applicable.then_some(added)
    }

    /// A 90° interior angle makes the triangle right-angled at that vertex.
    fn right_triangle_judgment(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let [a, b, c] = three(params)?;
        let right = Equation::new(Expr::measure(a, b, c), Expr::Literal(90.0));
        if !self.kb.entails(&right) {
            return None;
        }
        let premises = self.equation_id(&right).into_iter().collect::<Vec<_>>();
        let mut added = Vec::new();
        self.push_fact("Triangle", &[a, b, c], &premises, "right_triangle_judgment_angle", params, &mut added);
        self.push_fact("RightTriangle", &[a, b, c], &premises, "right_triangle_judgment_angle", params, &mut added);
        Some(added)
    }

    /// Corresponding sides of congruent triangles are equal.
    fn congruent_lines(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let ([a, b, c], [d, e, f], fact) = self.congruence(params)?;
        let pairs = [
            (Expr::length(a, b), Expr::length(d, e)),
            (Expr::length(b, c), Expr::length(e, f)),
            (Expr::length(c, a), Expr::length(f, d)),
        ];
        let mut added = Vec::new();
        for (l, r) in pairs {
            self.push_equation(&Equation::new(l, r), &[fact], "congruent_triangle_property_line_equal", params, &mut added);
        }
        Some(added)
    }

    /// Corresponding angles of congruent triangles are equal.
    fn congruent_angles(&mut self, params: &[char]) -> Option<Vec<FactId>> {
        let ([a, b, c], [d, e, f], fact) = self.congruence(params)?;
        let pairs = [
            (Expr::measure(a, b, c), Expr::measure(d, e, f)),
            (Expr::measure(b, c, a), Expr::measure(e, f, d)),
            (Expr::measure(c, a, b), Expr::measure(f, d, e)),
        ];
        let mut added = Vec::new();
        for (l, r) in pairs {
            self.push_equation(&Equation::new(l, r), &[fact], "congruent_triangle_property_angle_equal", params, &mut added);
        }
        Some(added)
    }

    // ------------------------------ Helpers ------------------------------

    fn congruence(&self, params: &[char]) -> Option<([char; 3], [char; 3], FactId)> {
        if params.len() < 6 {
            return None;
        }
        let lhs = [params[0], params[1], params[2]];
        let rhs = [params[3], params[4], params[5]];
        let item = Item::Points(params[..6].to_vec());
        let fact = self.kb.id_of("CongruentBetweenTriangle", &item)?;
        Some((lhs, rhs, fact))
    }

    fn triangle_id_any_order(&self, a: char, b: char, c: char) -> Option<FactId> {
        let perms = [
            [a, b, c],
            [b, c, a],
            [c, a, b],
            [c, b, a],
            [b, a, c],
            [a, c, b],
        ];
        perms
            .iter()
            .find_map(|p| self.kb.id_of("Triangle", &Item::Points(p.to_vec())))
    }

    fn equation_id(&self, eq: &Equation) -> Option<FactId> {
        self.kb.id_of("Equation", &Item::Equation(eq.key()))
    }

    fn push_equation(
        &mut self,
        eq: &Equation,
        premises: &[FactId],
        theorem: &str,
        params: &[char],
        added: &mut Vec<FactId>,
    ) {
        let tag = TheoremTag::Theorem { name: theorem.to_string(), params: params.to_vec() };
        if let Ok((true, id)) = self.kb.add_equation(eq, premises, tag) {
            added.push(id);
        }
    }

    fn push_fact(
        &mut self,
        predicate: &str,
        points: &[char],
        premises: &[FactId],
        theorem: &str,
        params: &[char],
        added: &mut Vec<FactId>,
    ) {
        let tag = TheoremTag::Theorem { name: theorem.to_string(), params: params.to_vec() };
        if let Ok((true, id)) = self.kb.add(predicate, points, premises, tag) {
            added.push(id);
        }
    }
}

/// First three parameters, or `None` when the tuple is too short.
fn three(params: &[char]) -> Option<[char; 3]> {
    match params {
        [a, v, b, ..] => Some([*a, *v, *b]),
        _ => None,
    }
}

impl TheoremEngine for DeductiveEngine {
    fn load(&mut self, spec: &ProblemSpec) -> Result<(), InitError> {
        let mut kb = KnowledgeBase::new();
        let loaded = load_problem(&mut kb, spec)?;
        self.kb = kb;
        self.goal = Some(loaded.goal);
        self.expected_answer = loaded.expected_answer;
        self.centre = loaded.centre;
        Ok(())
    }

    fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    fn kb_mut(&mut self) -> &mut KnowledgeBase {
        &mut self.kb
    }

    fn theorem_names(&self) -> &'static [&'static str] {
        THEOREMS
    }

    fn centre_hint(&self) -> Option<char> {
        self.centre
    }

    fn apply_theorem(&mut self, name: &str, params: &[char]) -> Option<Update> {
        debug!(theorem = name, ?params, "apply");
        let added = match name {
            "circle_property_radius_equal" => self.radius_equal(params),
            "isosceles_triangle_judgment_two_sides_equal" => self.isosceles_judgment(params),
            "isosceles_triangle_property_angle_equal" => self.isosceles_base_angles(params),
            "triangle_property_angle_sum" => self.angle_sum(params),
            "diameter_of_circle_property_right_angle" => self.semicircle_right_angle(params),
            "right_triangle_judgment_angle" => self.right_triangle_judgment(params),
            "congruent_triangle_property_line_equal" => self.congruent_lines(params),
            "congruent_triangle_property_angle_equal" => self.congruent_angles(params),
            _ => None,
        }?;
        debug!(theorem = name, produced = added.len(), "applied");
        Some(Update { added })
    }

    fn check_goal(&self) -> GoalStatus {
        match &self.goal {
            None => GoalStatus::Unproved,
            Some(Goal::Equal(eq)) => {
                if self.kb.entails(eq) {
                    GoalStatus::Proved
                } else {
                    GoalStatus::Unproved
                }
            }
            Some(Goal::Value(expr)) => match self.kb.value_of(expr) {
                Some(v) => match self.expected_answer {
                    Some(expected) if (v - expected).abs() > ANSWER_EPS => GoalStatus::Unproved,
                    _ => GoalStatus::ProvedWithAnswer(v),
                },
                None => GoalStatus::Unproved,
            },
        }
    }
}

// ============================================================================
// Minimal engine (degraded adapter)
// ============================================================================

/// Has/add semantics only: problems load, nothing deduces, goals never close.
#[derive(Debug, Default)]
pub struct MinimalEngine {
    kb: KnowledgeBase,
    centre: Option<char>,
}

impl MinimalEngine {
    pub fn new() -> Self {
        Self { kb: KnowledgeBase::new(), centre: None }
    }
}

impl TheoremEngine for MinimalEngine {
    fn load(&mut self, spec: &ProblemSpec) -> Result<(), InitError> {
        let mut kb = KnowledgeBase::new();
        let loaded = load_problem(&mut kb, spec)?;
        self.kb = kb;
        self.centre = loaded.centre;
        Ok(())
    }

    fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    fn kb_mut(&mut self) -> &mut KnowledgeBase {
        &mut self.kb
    }

    fn theorem_names(&self) -> &'static [&'static str] {
        &[]
    }

    fn centre_hint(&self) -> Option<char> {
        self.centre
    }

    fn apply_theorem(&mut self, _name: &str, _params: &[char]) -> Option<Update> {
        None
    }

    fn check_goal(&self) -> GoalStatus {
        GoalStatus::Unproved
    }
}

// ============================================================================
// Tests
// ============================================================================

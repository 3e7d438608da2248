//! Knowledge base: versioned fact store with provenance & snapshots
//!
//! The KB is the single mutable structure a grade call owns. Facts are
//! `(predicate, item)` tuples grouped by predicate; every fact carries a
//! provenance record (`premises`, [`TheoremTag`]) and a monotonically
//! assigned [`FactId`]. Algebraic `Equal` claims live in a parallel equation
//! sub-store but share the same id space and are visible through the plain
//! `has`/`items_of` surface under the `"Equation"` predicate.
//!
//! ### Invariants
//! - Facts are append-only. Superseding a belief means restoring a snapshot,
//!   never editing in place.
//! - Premises must name ids that already exist (`premise < own id`).
//! - `Angle(X,Y,Z)` membership implies `Angle(Z,Y,X)` membership; the mirror
//!   fact is added automatically with `Symmetry(base)` provenance.
//! - A [`Snapshot`] is a deep value copy; restoring replaces the live state
//!   atomically and shares no storage with it.

#![forbid(unsafe_code)]
#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::cdl::{Equation, Expr};

/// Tolerance for numeric equation checks.
const EPS: f64 = 1e-6;

/// Identifier of one stored fact. Monotonic within a grade call.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FactId(pub u64);

impl FactId {
    /// Access the underlying id.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Why a fact is believed.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum TheoremTag {
    /// Introduced by the problem statement.
    Given,
    /// Asserted by the student with no support (bounded-trust admission).
    Assumption(u32),
    /// Produced by a theorem application.
    Theorem { name: String, params: Vec<char> },
    /// Lowered from an `Equal` claim at the given step.
    AlgebraicConstraint(u32),
    /// Mirror of another fact (angle reversal).
    Symmetry(FactId),
}

/// The stored item of a fact: point letters, or the canonical key of an
/// equation record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Item {
    Points(Vec<char>),
    Equation(String),
}

/// One KB entry.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Fact {
    pub id: FactId,
    pub predicate: String,
    pub item: Item,
    pub premises: Vec<FactId>,
    pub tag: TheoremTag,
}

/// Parsed form of a stored equation, kept alongside the fact list so the
/// solver never re-parses keys.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EquationRecord {
    pub id: FactId,
    pub eq: Equation,
}

/// Errors from KB mutation. The step verifier treats these as "could not
/// admit", not as aborts.
#[derive(Debug, thiserror::Error)]
pub enum KbError {
    #[error("predicate `{0}` has no slot in this KB")]
    NoSuchPredicate(String),
    #[error("refusing to store an empty item for `{0}`")]
    EmptyItem(String),
    #[error("Angle items take exactly 3 letters (got {0})")]
    BadAngleArity(usize),
    #[error("premise {premise:?} does not exist yet")]
    BadPremise { premise: FactId },
}

/// Restorable deep copy of the whole KB state.
#[derive(Clone, Debug)]
pub struct Snapshot(KnowledgeBase);

/// The knowledge base proper.
#[derive(Clone, Debug, Default, Serialize)]
pub struct KnowledgeBase {
    facts: Vec<Fact>,
    /// Per-predicate fact ids in insertion order. Present keys define the
    /// current predicate vocabulary (possibly with zero members).
    groups: BTreeMap<String, Vec<FactId>>,
    equations: Vec<EquationRecord>,
    next_id: u64,
    #[serde(skip)]
    index: HashMap<(String, Item), FactId>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        let mut kb = Self::default();
        kb.ensure_predicate_slot("Equation");
        kb
    }

    // ------------------------------ Queries ------------------------------

    /// Exact membership.
    pub fn has(&self, predicate: &str, item: &Item) -> bool {
        self.index.contains_key(&(predicate.to_string(), item.clone()))
    }

    /// Membership of a point-tuple fact.
    #[inline]
    pub fn has_points(&self, predicate: &str, points: &[char]) -> bool {
        self.has(predicate, &Item::Points(points.to_vec()))
    }

    /// Id of a stored fact, `None` when absent.
    pub fn id_of(&self, predicate: &str, item: &Item) -> Option<FactId> {
        self.index.get(&(predicate.to_string(), item.clone())).copied()
    }

    /// Whether the predicate has a slot (known vocabulary), populated or not.
    #[inline]
    pub fn knows_predicate(&self, predicate: &str) -> bool {
        self.groups.contains_key(predicate)
    }

    /// Facts of one predicate in insertion order.
    pub fn items_of(&self, predicate: &str) -> Vec<&Fact> {
        self.groups
            .get(predicate)
            .map(|ids| ids.iter().map(|id| self.fact(*id)).collect())
            .unwrap_or_default()
    }

    /// Look up a fact by id. Ids are dense, so this is an index access.
    #[inline]
    pub fn fact(&self, id: FactId) -> &Fact {
        &self.facts[id.0 as usize]
    }

    /// All facts in id order.
    #[inline]
    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    /// Stored equation records in insertion order.
    #[inline]
    pub fn equations(&self) -> &[EquationRecord] {
        &self.equations
    }

    /// Total fact count (equation records included).
    #[inline]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    // ----------------------------- Mutation ------------------------------

    /// Introduce an (initially empty) predicate family.
    pub fn ensure_predicate_slot(&mut self, predicate: &str) {
        self.groups.entry(predicate.to_string()).or_default();
    }

    /// Append a point-tuple fact.
    ///
    /// Returns `(false, existing_id)` when the fact is already present,
    /// `(true, fresh_id)` otherwise. A successful `Angle` add immediately
    /// appends the reversed angle with `Symmetry` provenance.
    pub fn add(
        &mut self,
        predicate: &str,
        points: &[char],
        premises: &[FactId],
        tag: TheoremTag,
    ) -> Result<(bool, FactId), KbError> {
        if points.is_empty() {
            return Err(KbError::EmptyItem(predicate.to_string()));
        }
        if predicate == "Angle" && points.len() != 3 {
            return Err(KbError::BadAngleArity(points.len()));
        }
        let item = Item::Points(points.to_vec());
        let (accepted, id) = self.insert(predicate, item, premises, tag)?;

        if accepted && predicate == "Angle" {
            let mirrored = [points[2], points[1], points[0]];
            if mirrored != [points[0], points[1], points[2]] {
                self.insert(
                    "Angle",
                    Item::Points(mirrored.to_vec()),
                    &[id],
                    TheoremTag::Symmetry(id),
                )?;
            }
        }
        Ok((accepted, id))
    }

    /// Lower an equation into the sub-store.
    ///
    /// The fact surface sees it as `("Equation", canonical key)`; the parsed
    /// tree is retained for the solver.
    pub fn add_equation(
        &mut self,
        eq: &Equation,
        premises: &[FactId],
        tag: TheoremTag,
    ) -> Result<(bool, FactId), KbError> {
        let item = Item::Equation(eq.key());
        let (accepted, id) = self.insert("Equation", item, premises, tag)?;
        if accepted {
            self.equations.push(EquationRecord { id, eq: eq.clone() });
        }
        Ok((accepted, id))
    }

    fn insert(
        &mut self,
        predicate: &str,
        item: Item,
        premises: &[FactId],
        tag: TheoremTag,
    ) -> Result<(bool, FactId), KbError> {
        if !self.groups.contains_key(predicate) {
            return Err(KbError::NoSuchPredicate(predicate.to_string()));
        }
        for p in premises {
            if p.0 >= self.next_id {
                return Err(KbError::BadPremise { premise: *p });
            }
        }
        let key = (predicate.to_string(), item.clone());
        if let Some(existing) = self.index.get(&key) {
            return Ok((false, *existing));
        }
        let id = FactId(self.next_id);
        self.next_id += 1;
        debug!(fact = %id.0, predicate, ?tag, "kb add");
        self.facts.push(Fact {
            id,
            predicate: predicate.to_string(),
            item,
            premises: premises.to_vec(),
            tag,
        });
        self.index.insert(key, id);
        self.groups.get_mut(predicate).expect("slot checked above").push(id);
        Ok((true, id))
    }

    // ----------------------------- Snapshots -----------------------------

    /// Deep, value-semantic copy of the full state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.clone())
    }

    /// Replace the live state with a snapshot's.
    pub fn restore(&mut self, snapshot: Snapshot) {
        *self = snapshot.0;
    }

    /// Canonical serialized form, used to compare states byte-for-byte.
    /// The membership index is derived data and excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("KB state serializes")
    }

    // ------------------------- Equation solving --------------------------

    /// Numeric propagation over the equation sub-store: repeatedly solve
    /// every linear equation that is one unknown short, until fixpoint.
    pub fn solved_values(&self) -> BTreeMap<String, f64> {
        let mut values: BTreeMap<String, f64> = BTreeMap::new();
        let linear: Vec<Option<LinearForm>> =
            self.equations.iter().map(|r| LinearForm::from_equation(&r.eq)).collect();

        // Each pass can bind at least one new atom, so the pass count is
        // bounded by the equation count.
        for _ in 0..=self.equations.len() {
            let mut changed = false;
            for lin in linear.iter().flatten() {
                if let Some((atom, value)) = lin.solve_single_unknown(&values) {
                    if !values.contains_key(&atom) {
                        values.insert(atom, value);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        values
    }

    /// Numeric value of an expression under the solved equation system.
    pub fn value_of(&self, expr: &Expr) -> Option<f64> {
        eval(expr, &self.solved_values())
    }

    /// Whether the equation system entails `eq`: stored verbatim, the two
    /// sides sit in the same symbolic equality class, or both sides resolve
    /// to the same number.
    pub fn entails(&self, eq: &Equation) -> bool {
        if self.has("Equation", &Item::Equation(eq.key())) {
            return true;
        }
        if let (Some(a), Some(b)) = (atom_key(&eq.lhs), atom_key(&eq.rhs)) {
            let mut classes = UnionFind::default();
            for rec in &self.equations {
                if let (Some(x), Some(y)) = (atom_key(&rec.eq.lhs), atom_key(&rec.eq.rhs)) {
                    classes.union(&x, &y);
                }
            }
            if classes.same(&a, &b) {
                return true;
            }
        }
        let values = self.solved_values();
        match (eval(&eq.lhs, &values), eval(&eq.rhs, &values)) {
            (Some(l), Some(r)) => (l - r).abs() < EPS,
            _ => false,
        }
    }
}

/// Render key of a single-atom expression, `None` for anything compound.
fn atom_key(e: &Expr) -> Option<String> {
    match e {
        Expr::Measure(_) | Expr::Length(_) | Expr::Symbol(_) => Some(e.render()),
        _ => None,
    }
}

fn eval(e: &Expr, values: &BTreeMap<String, f64>) -> Option<f64> {
    match e {
        Expr::Literal(v) => Some(*v),
        Expr::Add(a, b) => Some(eval(a, values)? + eval(b, values)?),
        Expr::Mul(a, b) => Some(eval(a, values)? * eval(b, values)?),
        atom => values.get(&atom.render()).copied(),
    }
}

// ============================================================================
// Linear forms
// ============================================================================

/// `Σ coeff·atom + constant`, the shape every lowerable equation side takes.
#[derive(Clone, Debug, Default)]
struct LinearForm {
    terms: Vec<(f64, String)>,
    constant: f64,
}

impl LinearForm {
    /// `lhs − rhs` as a single linear form, `None` when nonlinear.
    fn from_equation(eq: &Equation) -> Option<LinearForm> {
        let mut lhs = LinearForm::default();
        lhs.absorb(&eq.lhs, 1.0)?;
        lhs.absorb(&eq.rhs, -1.0)?;
        Some(lhs)
    }

    fn absorb(&mut self, e: &Expr, scale: f64) -> Option<()> {
        match e {
            Expr::Literal(v) => {
                self.constant += scale * v;
                Some(())
            }
            Expr::Add(a, b) => {
                self.absorb(a, scale)?;
                self.absorb(b, scale)
            }
            Expr::Mul(a, b) => match (constant_of(a), constant_of(b)) {
                (Some(c), _) => self.absorb(b, scale * c),
                (None, Some(c)) => self.absorb(a, scale * c),
                (None, None) => None,
            },
            atom => {
                self.terms.push((scale, atom.render()));
                Some(())
            }
        }
    }

    /// If substituting `values` leaves exactly one unknown with a usable
    /// coefficient, return its solution.
    fn solve_single_unknown(&self, values: &BTreeMap<String, f64>) -> Option<(String, f64)> {
        let mut rest = self.constant;
        let mut unknown: Option<(f64, &str)> = None;
        for (coeff, atom) in &self.terms {
            match values.get(atom) {
                Some(v) => rest += coeff * v,
                None => match unknown {
                    None => unknown = Some((*coeff, atom.as_str())),
                    // Same atom twice still counts as one unknown.
                    Some((c, a)) if a == atom.as_str() => unknown = Some((c + coeff, a)),
                    Some(_) => return None,
                },
            }
        }
        let (coeff, atom) = unknown?;
        if coeff.abs() < EPS {
            return None;
        }
        Some((atom.to_string(), -rest / coeff))
    }
}

fn constant_of(e: &Expr) -> Option<f64> {
    match e {
        Expr::Literal(v) => Some(*v),
        Expr::Add(a, b) => Some(constant_of(a)? + constant_of(b)?),
        Expr::Mul(a, b) => Some(constant_of(a)? * constant_of(b)?),
        _ => None,
    }
}

/// Tiny union-find over atom keys, for symbolic equality chains.
#[derive(Default)]
struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    fn find(&mut self, x: &str) -> String {
        let p = match self.parent.get(x) {
            Some(p) if p != x => p.clone(),
            _ => return x.to_string(),
        };
        let root = self.find(&p);
        self.parent.insert(x.to_string(), root.clone());
        root
    }

    fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }

    fn same(&mut self, a: &str, b: &str) -> bool {
        self.find(a) == self.find(b)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdl::Expr;

    fn kb_with(preds: &[&str]) -> KnowledgeBase {
        let mut kb = KnowledgeBase::new();
        for p in preds {
            kb.ensure_predicate_slot(p);
        }
        kb
    }

    #[test]
    fn add_and_duplicate_detection() {
        let mut kb = kb_with(&["Triangle"]);
        let (ok, id) = kb.add("Triangle", &['A', 'B', 'C'], &[], TheoremTag::Given).unwrap();
        assert!(ok);
        let (ok2, id2) = kb.add("Triangle", &['A', 'B', 'C'], &[], TheoremTag::Given).unwrap();
        assert!(!ok2);
        assert_eq!(id, id2);
        assert!(kb.has_points("Triangle", &['A', 'B', 'C']));
        assert!(!kb.has_points("Triangle", &['A', 'C', 'B']));
    }

    #[test]
    fn angle_symmetry_closure() {
        let mut kb = kb_with(&["Angle"]);
        let (ok, base) = kb.add("Angle", &['X', 'Y', 'Z'], &[], TheoremTag::Given).unwrap();
        assert!(ok);
        assert!(kb.has_points("Angle", &['Z', 'Y', 'X']));
        let mirror = kb
            .items_of("Angle")
            .into_iter()
            .find(|f| f.item == Item::Points(vec!['Z', 'Y', 'X']))
            .unwrap();
        assert_eq!(mirror.tag, TheoremTag::Symmetry(base));
        assert_eq!(mirror.premises, vec![base]);
    }

    #[test]
    fn premises_must_exist() {
        let mut kb = kb_with(&["Triangle"]);
        let err = kb.add("Triangle", &['A', 'B', 'C'], &[FactId(7)], TheoremTag::Given);
        assert!(matches!(err, Err(KbError::BadPremise { .. })));
    }

    #[test]
    fn ids_are_monotonic_and_ordered() {
        let mut kb = kb_with(&["Line"]);
        let mut last = None;
        for pts in [['A', 'B'], ['B', 'C'], ['C', 'D']] {
            let (_, id) = kb.add("Line", &pts, &[], TheoremTag::Given).unwrap();
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
        let order: Vec<_> = kb.items_of("Line").iter().map(|f| f.id).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn snapshot_restore_is_byte_faithful() {
        let mut kb = kb_with(&["Angle", "Triangle"]);
        kb.add("Triangle", &['A', 'B', 'C'], &[], TheoremTag::Given).unwrap();
        let eq = Equation::new(Expr::measure('A', 'B', 'C'), Expr::Literal(40.0));
        kb.add_equation(&eq, &[], TheoremTag::AlgebraicConstraint(1)).unwrap();

        let before = kb.canonical_bytes();
        let snap = kb.snapshot();

        kb.add("Angle", &['D', 'E', 'F'], &[], TheoremTag::Assumption(2)).unwrap();
        let eq2 = Equation::new(Expr::measure('D', 'E', 'F'), Expr::Literal(90.0));
        kb.add_equation(&eq2, &[], TheoremTag::AlgebraicConstraint(2)).unwrap();
        assert_ne!(kb.canonical_bytes(), before);

        kb.restore(snap);
        assert_eq!(kb.canonical_bytes(), before);
        // The index is rebuilt state too: membership agrees after restore.
        assert!(!kb.has_points("Angle", &['D', 'E', 'F']));
        assert!(kb.has_points("Triangle", &['A', 'B', 'C']));
    }

    #[test]
    fn equation_store_is_orientation_insensitive() {
        let mut kb = KnowledgeBase::new();
        let ab = Equation::new(Expr::length('A', 'B'), Expr::length('C', 'D'));
        let ba = Equation::new(Expr::length('C', 'D'), Expr::length('A', 'B'));
        let (ok, _) = kb.add_equation(&ab, &[], TheoremTag::Given).unwrap();
        assert!(ok);
        let (ok2, _) = kb.add_equation(&ba, &[], TheoremTag::Given).unwrap();
        assert!(!ok2, "reversed orientation is the same constraint");
    }

    #[test]
    fn numeric_propagation_chains() {
        let mut kb = KnowledgeBase::new();
        // ∠ABC = 40, ∠DEF = ∠ABC  ⇒  ∠DEF = 40.
        let abc = Expr::measure('A', 'B', 'C');
        let def = Expr::measure('D', 'E', 'F');
        kb.add_equation(
            &Equation::new(abc.clone(), Expr::Literal(40.0)),
            &[],
            TheoremTag::AlgebraicConstraint(1),
        )
        .unwrap();
        kb.add_equation(
            &Equation::new(def.clone(), abc.clone()),
            &[],
            TheoremTag::AlgebraicConstraint(2),
        )
        .unwrap();
        assert_eq!(kb.value_of(&def), Some(40.0));
        assert!(kb.entails(&Equation::new(def, Expr::Literal(40.0))));
    }

    #[test]
    fn linear_sum_solves_last_unknown() {
        let mut kb = KnowledgeBase::new();
        // A + B + C = 180 with A=60, B=80 ⇒ C=40.
        let a = Expr::measure('X', 'A', 'Y');
        let b = Expr::measure('X', 'B', 'Y');
        let c = Expr::measure('X', 'C', 'Y');
        let sum = Expr::Add(
            Box::new(Expr::Add(Box::new(a.clone()), Box::new(b.clone()))),
            Box::new(c.clone()),
        );
        kb.add_equation(&Equation::new(sum, Expr::Literal(180.0)), &[], TheoremTag::Given)
            .unwrap();
        kb.add_equation(&Equation::new(a, Expr::Literal(60.0)), &[], TheoremTag::Given)
            .unwrap();
        kb.add_equation(&Equation::new(b, Expr::Literal(80.0)), &[], TheoremTag::Given)
            .unwrap();
        assert_eq!(kb.value_of(&c), Some(40.0));
    }

    #[test]
    fn symbolic_equality_chain_entails_without_numbers() {
        let mut kb = KnowledgeBase::new();
        let ab = Expr::length('A', 'B');
        let cd = Expr::length('C', 'D');
        let ef = Expr::length('E', 'F');
        kb.add_equation(&Equation::new(ab.clone(), cd.clone()), &[], TheoremTag::Given)
            .unwrap();
        kb.add_equation(&Equation::new(cd, ef.clone()), &[], TheoremTag::Given)
            .unwrap();
        assert!(kb.entails(&Equation::new(ab, ef)));
    }
}

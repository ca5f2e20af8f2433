//! Detection of queries that can never match.
//!
//! Each distinct tag reference and pseudo-tag invocation becomes a propositional atom.
//! The expression is then rewritten in disjunctive normal form, dropping every term that
//! contains both an atom and its negation along the way. If no term survives, the
//! expression is unsatisfiable.
//!
//! The rewrite can grow exponentially, so it gives up once a conjunction would pair more
//! than [`MAX_TERMS`] terms, or once [`MAX_STEPS`] pairings have been tried in total.
//! Giving up only means the query is sent to the database as usual.

use super::{PseudoTagArg, TagQueryExpr};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Maximum number of DNF terms kept before the check is abandoned.
pub const MAX_TERMS: usize = 4096;

/// Maximum number of term conjunctions attempted over a whole expression.
pub const MAX_STEPS: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Atom<'a> {
    Tag {
        label: &'a str,
        symbol: Option<char>,
    },
    PseudoTag {
        name: &'a str,
        arg: Option<&'a PseudoTagArg>,
    },
}

// Atom index -> polarity.
type Term = BTreeMap<usize, bool>;

type Dnf = BTreeSet<Term>;

/// Returns `true` when `expr` is proven to never match any picture.
///
/// A `false` result does not imply the expression is satisfiable.
pub fn is_unsatisfiable(expr: &TagQueryExpr) -> bool {
    let mut pruner = Pruner {
        atoms: HashMap::new(),
        steps: 0,
    };
    let result = pruner.dnf(expr, true);
    if result.is_none() {
        tracing::debug!(steps = pruner.steps, "satisfiability check abandoned");
    }
    matches!(result, Some(terms) if terms.is_empty())
}

struct Pruner<'a> {
    atoms: HashMap<Atom<'a>, usize>,
    // Term conjunctions attempted so far.
    steps: usize,
}

impl<'a> Pruner<'a> {
    fn dnf(&mut self, expr: &'a TagQueryExpr, positive: bool) -> Option<Dnf> {
        match expr {
            TagQueryExpr::Tag { label, symbol } => Some(self.literal(
                Atom::Tag {
                    label,
                    symbol: *symbol,
                },
                positive,
            )),
            TagQueryExpr::PseudoTag { name, arg } => Some(self.literal(
                Atom::PseudoTag {
                    name,
                    arg: arg.as_ref(),
                },
                positive,
            )),
            TagQueryExpr::Not(inner) => self.dnf(inner, !positive),
            // De Morgan: a negated OR is a conjunction, a negated AND a disjunction.
            TagQueryExpr::And(lhs, rhs) | TagQueryExpr::Or(lhs, rhs) => {
                let lhs = self.dnf(lhs, positive)?;
                let rhs = self.dnf(rhs, positive)?;
                let conjunction = matches!(expr, TagQueryExpr::And(..)) == positive;
                if conjunction {
                    self.product(&lhs, &rhs)
                } else {
                    union(lhs, rhs)
                }
            }
        }
    }

    fn literal(&mut self, atom: Atom<'a>, positive: bool) -> Dnf {
        let next = self.atoms.len();
        let index = *self.atoms.entry(atom).or_insert(next);
        BTreeSet::from([Term::from([(index, positive)])])
    }

    /// Conjunction of two DNFs. Gives up before starting when the pairs to try exceed
    /// [`MAX_TERMS`] or the remaining step budget.
    fn product(&mut self, lhs: &Dnf, rhs: &Dnf) -> Option<Dnf> {
        let pairs = lhs.len().saturating_mul(rhs.len());
        if pairs > MAX_TERMS || self.steps.saturating_add(pairs) > MAX_STEPS {
            return None;
        }
        self.steps += pairs;

        let mut terms = Dnf::new();
        for a in lhs {
            for b in rhs {
                if let Some(term) = merge(a, b) {
                    terms.insert(term);
                }
            }
        }
        Some(terms)
    }
}

fn union(mut lhs: Dnf, rhs: Dnf) -> Option<Dnf> {
    lhs.extend(rhs);
    (lhs.len() <= MAX_TERMS).then_some(lhs)
}

/// Conjunction of two terms, or `None` when they contradict each other.
fn merge(a: &Term, b: &Term) -> Option<Term> {
    let mut merged = a.clone();
    for (&atom, &polarity) in b {
        match merged.insert(atom, polarity) {
            Some(previous) if previous != polarity => return None,
            _ => {}
        }
    }
    Some(merged)
}

//! Michelson structural annotations: type (`:t`), field (`%f`) and
//! variable (`@v`) annotations, the `Notes` tree that mirrors a type, and
//! the merge/derivation rules the type checker applies when it lowers
//! untyped instructions.
//!
//! `converge` is a small lattice: the empty annotation and the `Star` node
//! are wildcards, concrete annotations must agree. The same helper is used
//! by the checker and the extension checker so the two cannot diverge.

use std::fmt;
use std::marker::PhantomData;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Annotation kinds
// ──────────────────────────────────────────────

/// Marker trait tying an annotation to its concrete-syntax sigil.
pub trait AnnotationKind {
    const SIGIL: char;
}

/// Kind marker for `:type` annotations.
#[derive(Debug)]
pub enum TypeTag {}
/// Kind marker for `%field` annotations.
#[derive(Debug)]
pub enum FieldTag {}
/// Kind marker for `@variable` annotations.
#[derive(Debug)]
pub enum VarTag {}

impl AnnotationKind for TypeTag {
    const SIGIL: char = ':';
}
impl AnnotationKind for FieldTag {
    const SIGIL: char = '%';
}
impl AnnotationKind for VarTag {
    const SIGIL: char = '@';
}

/// An annotation of kind `K`. The empty text is the absent ("unspecified")
/// annotation, which behaves as a wildcard under convergence.
pub struct Annotation<K> {
    text: String,
    _kind: PhantomData<K>,
}

pub type TypeAnn = Annotation<TypeTag>;
pub type FieldAnn = Annotation<FieldTag>;
pub type VarAnn = Annotation<VarTag>;

impl<K> Annotation<K> {
    /// The absent annotation.
    pub fn none() -> Self {
        Annotation {
            text: String::new(),
            _kind: PhantomData,
        }
    }

    pub fn new(text: impl Into<String>) -> Self {
        Annotation {
            text: text.into(),
            _kind: PhantomData,
        }
    }

    pub fn is_none(&self) -> bool {
        self.text.is_empty()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Exact-text test, used for the special `%`/`%%` variable spellings.
    pub fn matches(&self, text: &str) -> bool {
        self.text == text
    }

    /// Dotted concatenation; an empty side yields the other unchanged.
    pub fn append_text(&self, suffix: &str) -> Self {
        if suffix.is_empty() {
            return self.clone();
        }
        if self.text.is_empty() {
            return Annotation::new(suffix);
        }
        Annotation::new(format!("{}.{}", self.text, suffix))
    }

    /// Re-tag an annotation under a different kind, keeping its text.
    pub fn cast<L>(&self) -> Annotation<L> {
        Annotation {
            text: self.text.clone(),
            _kind: PhantomData,
        }
    }
}

// Manual impls: a derive would demand bounds on the uninhabited kind marker.

impl<K> Clone for Annotation<K> {
    fn clone(&self) -> Self {
        Annotation {
            text: self.text.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> PartialEq for Annotation<K> {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl<K> Eq for Annotation<K> {}

impl<K> Default for Annotation<K> {
    fn default() -> Self {
        Annotation::none()
    }
}

impl<K: AnnotationKind> fmt::Debug for Annotation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", K::SIGIL, self.text)
    }
}

impl<K: AnnotationKind> fmt::Display for Annotation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", K::SIGIL, self.text)
    }
}

impl<K> Serialize for Annotation<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de, K> Deserialize<'de> for Annotation<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Annotation::new(String::deserialize(deserializer)?))
    }
}

// ──────────────────────────────────────────────
// Annotation convergence
// ──────────────────────────────────────────────

/// Two concrete annotations disagreed during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnError {
    pub left: String,
    pub right: String,
}

impl fmt::Display for AnnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "annotation mismatch: '{}' does not converge with '{}'",
            self.left, self.right
        )
    }
}

impl std::error::Error for AnnError {}

/// Merge two annotations of the same kind: equal or one absent.
pub fn converge_anns<K>(a: &Annotation<K>, b: &Annotation<K>) -> Result<Annotation<K>, AnnError> {
    if a == b || b.is_none() {
        Ok(a.clone())
    } else if a.is_none() {
        Ok(b.clone())
    } else {
        Err(AnnError {
            left: a.text.clone(),
            right: b.text.clone(),
        })
    }
}

// ──────────────────────────────────────────────
// Notes: the annotation tree
// ──────────────────────────────────────────────

/// Structural annotations for a type, one node per type constructor.
///
/// `Star` is the fully-unspecified tree and converges with anything.
/// The node shape follows the component structure of the annotated type:
/// `Pair`/`Or` carry two field annotations and two children, `Option` one
/// of each, `Elem` covers the one-child types (list, set, contract),
/// `Entry` the two-child types (map, big_map, lambda).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notes {
    Star,
    Atom(TypeAnn),
    Pair {
        type_ann: TypeAnn,
        first_field: FieldAnn,
        second_field: FieldAnn,
        first: Box<Notes>,
        second: Box<Notes>,
    },
    Or {
        type_ann: TypeAnn,
        left_field: FieldAnn,
        right_field: FieldAnn,
        left: Box<Notes>,
        right: Box<Notes>,
    },
    Option {
        type_ann: TypeAnn,
        some_field: FieldAnn,
        some: Box<Notes>,
    },
    Elem {
        type_ann: TypeAnn,
        elem: Box<Notes>,
    },
    Entry {
        type_ann: TypeAnn,
        key: Box<Notes>,
        value: Box<Notes>,
    },
}

impl Notes {
    /// True when the tree carries no annotation at all.
    pub fn is_star(&self) -> bool {
        matches!(self, Notes::Star)
    }
}

/// Node-wise merge of two annotation trees over the same type.
///
/// `Star` on either side yields the other; two concrete nodes must carry
/// convergent annotations on every component and convergent children.
pub fn converge(a: &Notes, b: &Notes) -> Result<Notes, AnnError> {
    match (a, b) {
        (Notes::Star, other) => Ok(other.clone()),
        (other, Notes::Star) => Ok(other.clone()),
        (Notes::Atom(ta), Notes::Atom(tb)) => Ok(Notes::Atom(converge_anns(ta, tb)?)),
        (
            Notes::Pair {
                type_ann: ta,
                first_field: fa1,
                second_field: fa2,
                first: na1,
                second: na2,
            },
            Notes::Pair {
                type_ann: tb,
                first_field: fb1,
                second_field: fb2,
                first: nb1,
                second: nb2,
            },
        ) => Ok(Notes::Pair {
            type_ann: converge_anns(ta, tb)?,
            first_field: converge_anns(fa1, fb1)?,
            second_field: converge_anns(fa2, fb2)?,
            first: Box::new(converge(na1, nb1)?),
            second: Box::new(converge(na2, nb2)?),
        }),
        (
            Notes::Or {
                type_ann: ta,
                left_field: fa1,
                right_field: fa2,
                left: na1,
                right: na2,
            },
            Notes::Or {
                type_ann: tb,
                left_field: fb1,
                right_field: fb2,
                left: nb1,
                right: nb2,
            },
        ) => Ok(Notes::Or {
            type_ann: converge_anns(ta, tb)?,
            left_field: converge_anns(fa1, fb1)?,
            right_field: converge_anns(fa2, fb2)?,
            left: Box::new(converge(na1, nb1)?),
            right: Box::new(converge(na2, nb2)?),
        }),
        (
            Notes::Option {
                type_ann: ta,
                some_field: fa,
                some: na,
            },
            Notes::Option {
                type_ann: tb,
                some_field: fb,
                some: nb,
            },
        ) => Ok(Notes::Option {
            type_ann: converge_anns(ta, tb)?,
            some_field: converge_anns(fa, fb)?,
            some: Box::new(converge(na, nb)?),
        }),
        (
            Notes::Elem {
                type_ann: ta,
                elem: na,
            },
            Notes::Elem {
                type_ann: tb,
                elem: nb,
            },
        ) => Ok(Notes::Elem {
            type_ann: converge_anns(ta, tb)?,
            elem: Box::new(converge(na, nb)?),
        }),
        (
            Notes::Entry {
                type_ann: ta,
                key: ka,
                value: va,
            },
            Notes::Entry {
                type_ann: tb,
                key: kb,
                value: vb,
            },
        ) => Ok(Notes::Entry {
            type_ann: converge_anns(ta, tb)?,
            key: Box::new(converge(ka, kb)?),
            value: Box::new(converge(va, vb)?),
        }),
        // Shape disagreement: the types already converged, so the trees
        // describe different constructors of the same type. Impossible for
        // checker-built notes; report rather than panic.
        (left, right) => Err(AnnError {
            left: format!("{:?}", left),
            right: format!("{:?}", right),
        }),
    }
}

// ──────────────────────────────────────────────
// Derivation rules
// ──────────────────────────────────────────────

fn join_segments(segments: &[&str]) -> String {
    segments.join(".")
}

/// Annotation derivation for `PAIR`.
///
/// The `%@` field spelling asks for the component's variable annotation to
/// be split into a shared variable prefix and per-component field suffixes:
/// `@a.x` / `@a.y` become variable `@a` with fields `%x` / `%y`. A lone
/// `%@` promotes that component's variable into its field.
pub fn derive_pair_anns(
    p_field: &FieldAnn,
    q_field: &FieldAnn,
    p_var: &VarAnn,
    q_var: &VarAnn,
) -> (VarAnn, FieldAnn, FieldAnn) {
    let p_special = p_field.matches("@");
    let q_special = q_field.matches("@");
    match (p_special, q_special) {
        (true, true) if !p_var.is_none() && !q_var.is_none() => {
            let ps: Vec<&str> = p_var.text().split('.').collect();
            let qs: Vec<&str> = q_var.text().split('.').collect();
            let common = ps
                .iter()
                .zip(qs.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if common == 0 {
                (
                    VarAnn::none(),
                    FieldAnn::new(p_var.text()),
                    FieldAnn::new(q_var.text()),
                )
            } else {
                (
                    VarAnn::new(join_segments(&ps[..common])),
                    FieldAnn::new(join_segments(&ps[common..])),
                    FieldAnn::new(join_segments(&qs[common..])),
                )
            }
        }
        (true, true) => (
            VarAnn::none(),
            FieldAnn::new(p_var.text()),
            FieldAnn::new(q_var.text()),
        ),
        (true, false) => (VarAnn::none(), FieldAnn::new(p_var.text()), q_field.clone()),
        (false, true) => (VarAnn::none(), p_field.clone(), FieldAnn::new(q_var.text())),
        (false, false) => (VarAnn::none(), p_field.clone(), q_field.clone()),
    }
}

/// Variable derivation for `CAR`/`CDR`.
///
/// `@%` promotes the projected component's field annotation into the
/// result variable; `@%%` prefixes it with the pair's own variable.
pub fn derive_car_cdr_var(user_var: &VarAnn, child_field: &FieldAnn, pair_var: &VarAnn) -> VarAnn {
    if user_var.matches("%") {
        child_field.cast()
    } else if user_var.matches("%%") && !child_field.is_none() {
        pair_var.append_text(child_field.text())
    } else {
        user_var.clone()
    }
}

/// Child notes and branch variables for `IF_LEFT` and friends.
///
/// The branch variable is the scrutinee's variable extended by the branch
/// field annotation, defaulting to `left`/`right`.
pub fn derive_or_sub(notes: &Notes, outer_var: &VarAnn) -> (Notes, Notes, VarAnn, VarAnn) {
    let (left_field, right_field, left, right) = match notes {
        Notes::Or {
            left_field,
            right_field,
            left,
            right,
            ..
        } => (
            left_field.clone(),
            right_field.clone(),
            (**left).clone(),
            (**right).clone(),
        ),
        _ => (
            FieldAnn::none(),
            FieldAnn::none(),
            Notes::Star,
            Notes::Star,
        ),
    };
    let left_suffix = if left_field.is_none() {
        "left".to_string()
    } else {
        left_field.text().to_string()
    };
    let right_suffix = if right_field.is_none() {
        "right".to_string()
    } else {
        right_field.text().to_string()
    };
    (
        left,
        right,
        outer_var.append_text(&left_suffix),
        outer_var.append_text(&right_suffix),
    )
}

/// Child notes and the `Some`-branch variable for `IF_NONE`.
pub fn derive_option_sub(notes: &Notes, outer_var: &VarAnn) -> (Notes, VarAnn) {
    let (some_field, some) = match notes {
        Notes::Option {
            some_field, some, ..
        } => (some_field.clone(), (**some).clone()),
        _ => (FieldAnn::none(), Notes::Star),
    };
    let suffix = if some_field.is_none() {
        "some".to_string()
    } else {
        some_field.text().to_string()
    };
    (some, outer_var.append_text(&suffix))
}

/// Extend a variable annotation by a derived suffix; the absent variable
/// stays absent.
pub fn derive_var(suffix: &str, input: &VarAnn) -> VarAnn {
    if input.is_none() {
        VarAnn::none()
    } else {
        input.append_text(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn star() -> Notes {
        Notes::Star
    }

    fn atom(t: &str) -> Notes {
        Notes::Atom(TypeAnn::new(t))
    }

    #[test]
    fn converge_star_is_identity() {
        let n = atom("t");
        assert_eq!(converge(&star(), &n), Ok(n.clone()));
        assert_eq!(converge(&n, &star()), Ok(n));
    }

    #[test]
    fn converge_equal_atoms() {
        assert_eq!(converge(&atom("t"), &atom("t")), Ok(atom("t")));
    }

    #[test]
    fn converge_absent_ann_is_wildcard() {
        assert_eq!(converge(&atom(""), &atom("t")), Ok(atom("t")));
    }

    #[test]
    fn converge_conflicting_atoms_fails() {
        assert!(converge(&atom("t"), &atom("u")).is_err());
    }

    #[test]
    fn converge_pairs_recursively() {
        let a = Notes::Pair {
            type_ann: TypeAnn::none(),
            first_field: FieldAnn::new("x"),
            second_field: FieldAnn::none(),
            first: Box::new(atom("t")),
            second: Box::new(star()),
        };
        let b = Notes::Pair {
            type_ann: TypeAnn::new("p"),
            first_field: FieldAnn::none(),
            second_field: FieldAnn::new("y"),
            first: Box::new(star()),
            second: Box::new(atom("u")),
        };
        let merged = converge(&a, &b).unwrap();
        assert_eq!(
            merged,
            Notes::Pair {
                type_ann: TypeAnn::new("p"),
                first_field: FieldAnn::new("x"),
                second_field: FieldAnn::new("y"),
                first: Box::new(atom("t")),
                second: Box::new(atom("u")),
            }
        );
    }

    #[test]
    fn pair_special_fields_split_common_var_prefix() {
        let (var, pf, qf) = derive_pair_anns(
            &FieldAnn::new("@"),
            &FieldAnn::new("@"),
            &VarAnn::new("a.x"),
            &VarAnn::new("a.y"),
        );
        assert_eq!(var, VarAnn::new("a"));
        assert_eq!(pf, FieldAnn::new("x"));
        assert_eq!(qf, FieldAnn::new("y"));
    }

    #[test]
    fn pair_special_fields_without_common_prefix() {
        let (var, pf, qf) = derive_pair_anns(
            &FieldAnn::new("@"),
            &FieldAnn::new("@"),
            &VarAnn::new("a"),
            &VarAnn::new("b"),
        );
        assert!(var.is_none());
        assert_eq!(pf, FieldAnn::new("a"));
        assert_eq!(qf, FieldAnn::new("b"));
    }

    #[test]
    fn pair_single_special_field_promotes_var() {
        let (var, pf, qf) = derive_pair_anns(
            &FieldAnn::new("@"),
            &FieldAnn::new("q"),
            &VarAnn::new("v"),
            &VarAnn::none(),
        );
        assert!(var.is_none());
        assert_eq!(pf, FieldAnn::new("v"));
        assert_eq!(qf, FieldAnn::new("q"));
    }

    #[test]
    fn car_cdr_var_specials() {
        let field = FieldAnn::new("balance");
        let pair_var = VarAnn::new("stg");
        assert_eq!(
            derive_car_cdr_var(&VarAnn::new("%"), &field, &pair_var),
            VarAnn::new("balance")
        );
        assert_eq!(
            derive_car_cdr_var(&VarAnn::new("%%"), &field, &pair_var),
            VarAnn::new("stg.balance")
        );
        assert_eq!(
            derive_car_cdr_var(&VarAnn::new("out"), &field, &pair_var),
            VarAnn::new("out")
        );
    }

    #[test]
    fn or_sub_defaults_left_right() {
        let (ln, rn, lv, rv) = derive_or_sub(&Notes::Star, &VarAnn::new("v"));
        assert!(ln.is_star() && rn.is_star());
        assert_eq!(lv, VarAnn::new("v.left"));
        assert_eq!(rv, VarAnn::new("v.right"));
    }

    #[test]
    fn option_sub_uses_some_field() {
        let notes = Notes::Option {
            type_ann: TypeAnn::none(),
            some_field: FieldAnn::new("content"),
            some: Box::new(Notes::Atom(TypeAnn::new("t"))),
        };
        let (sub, var) = derive_option_sub(&notes, &VarAnn::new("v"));
        assert_eq!(sub, Notes::Atom(TypeAnn::new("t")));
        assert_eq!(var, VarAnn::new("v.content"));
    }

    #[test]
    fn derive_var_skips_absent_input() {
        assert!(derive_var("hd", &VarAnn::none()).is_none());
        assert_eq!(derive_var("hd", &VarAnn::new("l")), VarAnn::new("l.hd"));
    }
}

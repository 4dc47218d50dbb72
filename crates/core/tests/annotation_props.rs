// Property tests for the annotation-merge lattice.
//
// The checker leans on `converge` being a well-behaved merge: the order in
// which branch stacks are folded together must never change the result.

use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;

use mica_core::annotation::{converge, FieldAnn, Notes, TypeAnn};

fn ann_strategy() -> BoxedStrategy<String> {
    prop_oneof![
        Just(String::new()),
        Just("owner".to_string()),
        Just("amount".to_string()),
        Just("left".to_string()),
    ]
    .boxed()
}

fn atom_strategy() -> BoxedStrategy<Notes> {
    prop_oneof![
        Just(Notes::Star),
        ann_strategy().prop_map(|t| Notes::Atom(TypeAnn::new(t))),
    ]
    .boxed()
}

/// Notes over a fixed shape, `pair t (or t t)`, with `Star` allowed at
/// every level. A fixed shape keeps the merges meaningful: differently
/// shaped trees can only ever meet if the types already diverged.
fn notes_strategy() -> BoxedStrategy<Notes> {
    let or_node = prop_oneof![
        Just(Notes::Star),
        (
            ann_strategy(),
            ann_strategy(),
            ann_strategy(),
            atom_strategy(),
            atom_strategy()
        )
            .prop_map(|(t, lf, rf, l, r)| Notes::Or {
                type_ann: TypeAnn::new(t),
                left_field: FieldAnn::new(lf),
                right_field: FieldAnn::new(rf),
                left: Box::new(l),
                right: Box::new(r),
            }),
    ];
    prop_oneof![
        Just(Notes::Star),
        (
            ann_strategy(),
            ann_strategy(),
            ann_strategy(),
            atom_strategy(),
            or_node
        )
            .prop_map(|(t, f1, f2, first, second)| Notes::Pair {
                type_ann: TypeAnn::new(t),
                first_field: FieldAnn::new(f1),
                second_field: FieldAnn::new(f2),
                first: Box::new(first),
                second: Box::new(second),
            }),
    ]
    .boxed()
}

proptest! {
    #[test]
    fn converge_is_commutative(a in notes_strategy(), b in notes_strategy()) {
        let ab = converge(&a, &b);
        let ba = converge(&b, &a);
        prop_assert_eq!(ab.is_ok(), ba.is_ok());
        if let (Ok(x), Ok(y)) = (ab, ba) {
            prop_assert_eq!(x, y);
        }
    }

    #[test]
    fn converge_is_idempotent(a in notes_strategy()) {
        prop_assert_eq!(converge(&a, &a), Ok(a));
    }

    #[test]
    fn converge_is_associative(
        a in notes_strategy(),
        b in notes_strategy(),
        c in notes_strategy(),
    ) {
        let left = converge(&a, &b).and_then(|ab| converge(&ab, &c));
        let right = converge(&b, &c).and_then(|bc| converge(&a, &bc));
        prop_assert_eq!(left.is_ok(), right.is_ok());
        if let (Ok(x), Ok(y)) = (left, right) {
            prop_assert_eq!(x, y);
        }
    }

    #[test]
    fn star_is_the_identity(a in notes_strategy()) {
        prop_assert_eq!(converge(&Notes::Star, &a), Ok(a.clone()));
        prop_assert_eq!(converge(&a, &Notes::Star), Ok(a));
    }
}

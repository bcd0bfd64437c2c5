use std::collections::BTreeMap;

use proptest::prelude::*;
use tableshift::derive::{
    derive, seeded, ColumnMapping, Condition, DerivationRule, Outcome, PredicateRow,
    PredicateTable,
};
use tableshift::value::{SourceRow, Value};

const TYPES: &[&str] = &[
    "House", "Villa", "Condo", "Townhouse", "Apartment", "Studio", "Cottage",
];

fn listing(key: &str, property_type: &str, sqft: i64) -> SourceRow {
    let mut values = BTreeMap::new();
    values.insert("id".to_string(), Value::from(key));
    values.insert("property_type".to_string(), Value::from(property_type));
    values.insert("square_feet".to_string(), Value::Integer(sqft));
    SourceRow::new(Value::from(key), values)
}

fn listing_type_rule() -> DerivationRule {
    DerivationRule::RandomizedConditional {
        rule_id: "listing_type_both".into(),
        when: Condition::one_of("property_type", ["House", "Condo", "Townhouse"]),
        probability: 0.1,
        value: Value::from("both"),
        otherwise: Box::new(DerivationRule::computed(PredicateTable::new(
            vec![PredicateRow {
                when: Condition::one_of("property_type", ["Apartment", "Studio"]),
                then: Outcome::literal("rent"),
            }],
            Outcome::literal("sale"),
        ))),
    }
}

proptest! {
    #[test]
    fn randomized_rules_are_reproducible(key in "[a-z0-9-]{1,24}", ty in 0usize..7, sqft in 0i64..10_000) {
        let row = listing(&key, TYPES[ty], sqft);
        let mapping = ColumnMapping::derived("property_listing_type", listing_type_rule());
        let first = derive(&row, &mapping).unwrap();
        let second = derive(&row.clone(), &mapping).unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn rent_only_types_never_draw(key in "[a-z0-9-]{1,24}") {
        let mapping = ColumnMapping::derived("property_listing_type", listing_type_rule());
        prop_assert_eq!(derive(&listing(&key, "Studio", 400), &mapping).unwrap(), Value::from("rent"));
    }

    #[test]
    fn unit_draw_is_pure(key in any::<i64>(), rule in "[a-z_]{1,16}") {
        let k = Value::Integer(key);
        prop_assert_eq!(seeded::unit_draw(&k, &rule), seeded::unit_draw(&k, &rule));
    }
}

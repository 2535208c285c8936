//! Event-descriptor matching, including the documented matching matrix and
//! property coverage of the token-prefix rule.

use harelite::event::EventDescriptor;
use proptest::prelude::*;

#[test]
fn matching_matrix_for_a_three_token_event() {
    let event = "error.communication.timeout";
    for matching in ["error", "error.communication", "error.communication.timeout", "*"] {
        assert!(
            EventDescriptor::parse(matching).matches(event),
            "{matching} should match {event}"
        );
    }
    for non_matching in ["error.execution", "communication", "error.communication.timeout.hard"] {
        assert!(
            !EventDescriptor::parse(non_matching).matches(event),
            "{non_matching} should not match {event}"
        );
    }
}

#[test]
fn specificity_orders_prefixes() {
    let broad = EventDescriptor::parse("error");
    let narrow = EventDescriptor::parse("error.communication");
    assert!(narrow.specificity() > broad.specificity());
    assert_eq!(EventDescriptor::parse("*").specificity(), 0);
}

fn token() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,6}"
}

fn tokens() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(token(), 1..5)
}

proptest! {
    /// Every token prefix of an event name matches it.
    #[test]
    fn prefixes_always_match(name_tokens in tokens(), cut in 0usize..5) {
        let name = name_tokens.join(".");
        let cut = 1 + cut % name_tokens.len();
        let descriptor = EventDescriptor::parse(&name_tokens[..cut].join("."));
        prop_assert!(descriptor.matches(&name));
        prop_assert_eq!(descriptor.specificity(), cut);
    }

    /// A descriptor longer than the event name never matches it.
    #[test]
    fn longer_descriptors_never_match(name_tokens in tokens(), extra in token()) {
        let name = name_tokens.join(".");
        let mut longer = name_tokens;
        longer.push(extra);
        let descriptor = EventDescriptor::parse(&longer.join("."));
        prop_assert!(!descriptor.matches(&name));
    }

    /// The wildcard matches everything.
    #[test]
    fn wildcard_matches_everything(name_tokens in tokens()) {
        prop_assert!(EventDescriptor::parse("*").matches(&name_tokens.join(".")));
    }

    /// Display output parses back to an equal descriptor.
    #[test]
    fn display_round_trips(name_tokens in tokens()) {
        let descriptor = EventDescriptor::parse(&name_tokens.join("."));
        prop_assert_eq!(EventDescriptor::parse(&descriptor.to_string()), descriptor);
    }
}

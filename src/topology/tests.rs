use super::*;

#[test]
fn star_matches_exactly_one_word() {
    assert!(matches("payment.*", "payment.created"));
    assert!(matches("payment.*", "payment.failed"));
    assert!(!matches("payment.*", "payment.audit.created"));
    assert!(!matches("payment.*", "payment"));
}

#[test]
fn hash_matches_zero_or_more_words() {
    assert!(matches("payment.#", "payment.created"));
    assert!(matches("payment.#", "payment.failed"));
    assert!(matches("payment.#", "payment.audit.created"));
    assert!(matches("payment.#", "payment"));
    assert!(!matches("payment.#", "refund.created"));
}

#[test]
fn hash_alone_matches_everything() {
    assert!(matches("#", "a"));
    assert!(matches("#", "a.b.c"));
    assert!(matches("#.#", "a.b"));
}

#[test]
fn hash_in_the_middle() {
    assert!(matches("payment.#.created", "payment.created"));
    assert!(matches("payment.#.created", "payment.audit.eu.created"));
    assert!(!matches("payment.#.created", "payment.audit.failed"));
}

#[test]
fn literal_patterns_need_exact_keys() {
    assert!(matches("user.signed_up", "user.signed_up"));
    assert!(!matches("user.signed_up", "user.signed_up.v2"));
    assert!(!matches("user.signed_up", "user"));
}

#[test]
fn naming_conventions() {
    let queue = queue_name("billing", "payments");
    assert_eq!(queue, "billing.payments.queue");
    assert_eq!(dead_letter_name(&queue), "billing.payments.queue.dlq");
}

#[test]
fn dead_letter_declarations_bind_everything() {
    let decls = dead_letter_declarations("billing.payments.queue");
    assert_eq!(decls.len(), 3);
    assert_eq!(
        decls[0],
        Declaration::Exchange(ExchangeSpec::topic("billing.payments.queue.dlq"))
    );
    assert_eq!(
        decls[2],
        Declaration::Binding(BindingSpec::new(
            "billing.payments.queue.dlq",
            "billing.payments.queue.dlq",
            "#"
        ))
    );
}

#[test]
fn default_exchange_is_durable_topic() {
    let spec = ExchangeSpec::default();
    assert_eq!(spec.name, DEFAULT_EXCHANGE);
    assert_eq!(spec.kind, ExchangeKind::Topic);
    assert!(spec.durable);
}

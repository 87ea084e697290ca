//! Mutators bound through a `Fuzz` registry: leaf values, alternative
//! choices, repetition counts and the recursion ceiling.

use protodomain::fuzz::{
    AltMutator, DataMutator, FixedMutator, IntegerBoundaryMutator, RepeatMutator, SequenceGenerator,
};
use protodomain::{parse, BitString, EngineError, Fuzz, FuzzError, MutatorMode, Session, SessionConfig, Symbol};

fn symbol(src: &str) -> Symbol {
    parse(src).expect("parse").remove(0)
}

fn session() -> Session {
    Session::new(SessionConfig::default().with_seed(11))
}

// ==================== Leaf mutators ====================

#[test]
fn fixed_mutator_ignores_the_domain() {
    let sym = symbol(r#"symbol "T" { tag: uint8(1); body: raw(2); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set(sym.field("tag").expect("tag").domain(), FixedMutator::new(BitString::from_bytes(&[0xff])));
    let mut session = session();
    session.set_fuzz(fuzz);
    for _ in 0..4 {
        let message = session.specialize(&sym).expect("specialize");
        assert_eq!(message.to_bytes()[0], 0xff);
        assert_eq!(message.to_bytes().len(), 3);
    }
    // The grammar itself no longer accepts what was sent.
    let bytes = session.specialize(&sym).expect("specialize").to_bytes();
    assert!(session.abstract_message(std::slice::from_ref(&sym), &bytes).is_none());
}

#[test]
fn generate_mode_keeps_length_bounds() {
    let sym = symbol(r#"symbol "T" { body: raw(1..=3); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set(sym.field("body").expect("body").domain(), DataMutator::seeded(MutatorMode::Generate, 3));
    let mut session = session();
    session.set_fuzz(fuzz);
    for _ in 0..32 {
        let len = session.specialize(&sym).expect("specialize").to_bytes().len();
        assert!((1..=3).contains(&len), "length {}", len);
    }
}

#[test]
fn mutate_mode_flips_one_bit_of_the_normal_value() {
    let sym = symbol(r#"symbol "T" { word: uint16(0x1234); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set(sym.field("word").expect("word").domain(), DataMutator::seeded(MutatorMode::Mutate, 5));
    assert_eq!(fuzz.mode(sym.field("word").expect("word").id()), Some(MutatorMode::Mutate));
    let mut session = session();
    session.set_fuzz(fuzz);
    for _ in 0..16 {
        let bytes = session.specialize(&sym).expect("specialize").to_bytes();
        let word = u16::from_be_bytes([bytes[0], bytes[1]]);
        assert_eq!((word ^ 0x1234).count_ones(), 1, "{:#06x}", word);
    }
}

#[test]
fn unsigned_boundaries_then_exhausted() {
    let sym = symbol(r#"symbol "T" { n: uint8(); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set(sym.field("n").expect("n").domain(), IntegerBoundaryMutator::new(8, false));
    let mut session = session();
    session.set_fuzz(fuzz);
    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(session.specialize(&sym).expect("specialize").to_bytes()[0]);
    }
    assert_eq!(seen, vec![0, 1, 127, 128, 254, 255]);
    let err = session.specialize(&sym).unwrap_err();
    assert!(matches!(err, EngineError::Fuzz(FuzzError::Exhausted)), "{:?}", err);
}

#[test]
fn counter_max_stops_a_data_mutator() {
    let sym = symbol(r#"symbol "T" { n: raw(1); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set(
        sym.field("n").expect("n").domain(),
        DataMutator::seeded(MutatorMode::Generate, 0).with_counter_max(2),
    );
    let mut session = session();
    session.set_fuzz(fuzz);
    session.specialize(&sym).expect("first");
    session.specialize(&sym).expect("second");
    let err = session.specialize(&sym).unwrap_err();
    assert!(matches!(err, EngineError::Fuzz(FuzzError::MaxCounter(2))), "{:?}", err);
}

#[test]
fn fuzzed_relation_is_not_recomputed() {
    let sym = symbol(r#"symbol "T" { body: raw(4); crc: crc32(body); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set(sym.field("crc").expect("crc").domain(), FixedMutator::new(BitString::from_bytes(&[0; 4])));
    let mut session = session();
    session.set_fuzz(fuzz);
    let message = session.specialize(&sym).expect("specialize");
    assert_eq!(message.field("crc").expect("crc").to_bytes(), vec![0; 4]);
}

#[test]
fn fuzzed_values_are_not_memorized() {
    let sym = symbol(r#"symbol "T" { token: raw(2) @persistent; }"#);
    let token = sym.field("token").expect("token").id();
    let mut fuzz = Fuzz::new();
    fuzz.set(sym.field("token").expect("token").domain(), FixedMutator::new(BitString::from_bytes(&[0xbe, 0xef])));
    let mut session = session();
    session.set_fuzz(fuzz);
    session.specialize(&sym).expect("fuzzed");
    assert!(!session.memory().contains(token));

    assert!(session.clear_fuzz().is_some());
    let normal = session.specialize(&sym).expect("normal");
    assert_eq!(session.memory().recall(token), message_field(&normal, "token").as_ref());
}

fn message_field(message: &protodomain::Message, name: &str) -> Option<BitString> {
    message.field(name).cloned()
}

// ==================== Alternatives and repetitions ====================

#[test]
fn alt_positions_choose_branches_in_order() {
    let sym = symbol(r#"symbol "T" { x: alt(uint8(1), uint8(2), uint8(3)); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set_alt(sym.field("x").expect("x").domain(), AltMutator::positions(vec![2, 0, 1]));
    let mut session = session();
    session.set_fuzz(fuzz);
    let bytes: Vec<u8> = (0..3).map(|_| session.specialize(&sym).expect("specialize").to_bytes()[0]).collect();
    assert_eq!(bytes, vec![3, 1, 2]);
    let err = session.specialize(&sym).unwrap_err();
    assert!(matches!(err, EngineError::Fuzz(FuzzError::Exhausted)), "{:?}", err);
}

#[test]
fn alt_position_out_of_range() {
    let sym = symbol(r#"symbol "T" { x: alt(uint8(1), uint8(2), uint8(3)); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set_alt(sym.field("x").expect("x").domain(), AltMutator::positions(vec![5]));
    let mut session = session();
    session.set_fuzz(fuzz);
    let err = session.specialize(&sym).unwrap_err();
    assert!(
        matches!(err, EngineError::Fuzz(FuzzError::InvalidPosition { index: 5, len: 3 })),
        "{:?}",
        err
    );
}

#[test]
fn random_alt_mutator_stays_in_range() {
    let sym = symbol(r#"symbol "T" { x: alt(uint8(1), uint8(2)); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set_alt(sym.field("x").expect("x").domain(), AltMutator::random(9, 2));
    let mut session = session();
    session.set_fuzz(fuzz);
    for _ in 0..32 {
        let b = session.specialize(&sym).expect("specialize").to_bytes()[0];
        assert!(b == 1 || b == 2);
    }
}

/// Alternatives nested `levels` deep, each bound to a mutator that always
/// picks the first branch.
fn nested_alts(levels: usize) -> (Symbol, Fuzz) {
    let mut domain = "uint8(7)".to_string();
    for _ in 0..levels {
        domain = format!("alt({})", domain);
    }
    let sym = symbol(&format!(r#"symbol "Deep" {{ x: {}; }}"#, domain));
    let mut fuzz = Fuzz::new();
    for v in sym.field("x").expect("x").domain().iter().filter(|v| v.kind() == "Alt") {
        fuzz.set_alt(v, AltMutator::new(SequenceGenerator::new(vec![0]).cycle()));
    }
    (sym, fuzz)
}

#[test]
fn nested_alternatives_hit_the_depth_ceiling() {
    let (sym, fuzz) = nested_alts(21);
    let mut session = Session::new(SessionConfig::default().with_seed(1));
    session.set_fuzz(fuzz);
    let err = session.specialize(&sym).unwrap_err();
    assert!(matches!(err, EngineError::DepthExceeded { max: 20 }), "{:?}", err);
}

#[test]
fn depth_is_counted_per_message() {
    let (sym, fuzz) = nested_alts(2);
    let mut session = Session::new(SessionConfig::default().with_seed(1).with_max_alt_depth(2));
    session.set_fuzz(fuzz);
    for _ in 0..5 {
        assert_eq!(session.specialize(&sym).expect("specialize").to_bytes(), vec![7]);
    }

    let (sym, fuzz) = nested_alts(3);
    let mut session = Session::new(SessionConfig::default().with_seed(1).with_max_alt_depth(2));
    session.set_fuzz(fuzz);
    let err = session.specialize(&sym).unwrap_err();
    assert!(matches!(err, EngineError::DepthExceeded { max: 2 }), "{:?}", err);
}

#[test]
fn sibling_alternatives_share_the_depth_budget() {
    let sym = symbol(r#"symbol "T" { xs: repeat(alt(uint8(1), uint8(2)), 25); }"#);
    let mut fuzz = Fuzz::new();
    for v in sym.field("xs").expect("xs").domain().iter().filter(|v| v.kind() == "Alt") {
        fuzz.set_alt(v, AltMutator::new(SequenceGenerator::new(vec![0]).cycle()));
    }
    let mut session = session();
    session.set_fuzz(fuzz);
    let err = session.specialize(&sym).unwrap_err();
    assert!(matches!(err, EngineError::DepthExceeded { max: 20 }), "{:?}", err);

    let sym = symbol(r#"symbol "T" { xs: repeat(alt(uint8(1), uint8(2)), 20); }"#);
    let mut fuzz = Fuzz::new();
    for v in sym.field("xs").expect("xs").domain().iter().filter(|v| v.kind() == "Alt") {
        fuzz.set_alt(v, AltMutator::new(SequenceGenerator::new(vec![0]).cycle()));
    }
    let mut session = self::session();
    session.set_fuzz(fuzz);
    assert_eq!(session.specialize(&sym).expect("specialize").to_bytes(), vec![1; 20]);
}

#[test]
fn repeat_mutator_may_leave_the_grammar_range() {
    let sym = symbol(r#"symbol "T" { xs: repeat(uint8(9), 1..3); }"#);
    let mut fuzz = Fuzz::new();
    fuzz.set_repeat(sym.field("xs").expect("xs").domain(), RepeatMutator::new(SequenceGenerator::new(vec![5, 0])));
    let mut session = session();
    session.set_fuzz(fuzz);
    assert_eq!(session.specialize(&sym).expect("five").to_bytes(), vec![9; 5]);
    assert!(session.specialize(&sym).expect("none").to_bytes().is_empty());
}

#[test]
fn random_repeat_mutator_uses_the_grammar_range() {
    let sym = symbol(r#"symbol "T" { xs: repeat(uint8(9), 2..=4, delimiter = 0x2c); }"#);
    let xs = sym.field("xs").expect("xs").domain();
    let count = match xs.variant() {
        protodomain::VariableKind::Repeat(r) => r.count,
        other => panic!("not a repeat: {:?}", other),
    };
    let mut fuzz = Fuzz::new();
    fuzz.set_repeat(xs, RepeatMutator::random(4, count));
    let mut session = session();
    session.set_fuzz(fuzz);
    for _ in 0..16 {
        let len = session.specialize(&sym).expect("specialize").to_bytes().len();
        assert!([3, 5, 7].contains(&len), "length {}", len);
    }
}

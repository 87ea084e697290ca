//! Engine tests: parse/specialize properties of the variable domain tree, built
//! directly with the `Variable` constructors.

use protodomain::domain::{RepeatCount, Svas, Variable};
use protodomain::error::EngineError;
use protodomain::message::{Field, MessageParser, MessageSpecializer, Symbol};
use protodomain::parser::{consumed, parse};
use protodomain::relation::hmac_digest;
use protodomain::types::{Integer, Ipv4, Raw};
use protodomain::{BitString, HashAlgorithm, Memory, Path, VariableSpecializer};
use rand::SeedableRng;
use rand_pcg::Pcg64;

fn specialize_one(var: &Variable, seed: u64) -> Path {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut paths = VariableSpecializer::new(&mut rng).specialize(var, Path::new()).expect("specialize");
    assert!(!paths.is_empty(), "no specialization for {}", var.name());
    paths.remove(0)
}

fn symbol(name: &str, fields: Vec<(&str, Variable)>) -> Symbol {
    Symbol::new(name, fields.into_iter().map(|(n, v)| Field::new(n, v)).collect()).expect("symbol")
}

// ==================== Round trip ====================

#[test]
fn specialized_bits_parse_back_exactly() {
    let payload = Variable::repeat("payload", Variable::data("byte", Integer::uint8()), RepeatCount::new(1, 6), None)
        .expect("repeat");
    let len = Variable::size("len", &[&payload], Integer::uint8()).expect("size");
    let kind = Variable::alt(
        "kind",
        vec![Variable::data("a", Raw::fixed(b"A".to_vec())), Variable::data("bb", Raw::fixed(b"BB".to_vec()))],
    )
    .expect("alt");
    let msg = Variable::agg("msg", vec![len, kind, payload]).expect("agg");

    for seed in 0..32 {
        let produced = specialize_one(&msg, seed).bits(msg.id()).expect("bits");
        let found = parse(&msg, Path::new(), &produced)
            .any(|p| consumed(&p, &msg) == produced.len() && p.pending().is_empty() && p.bits(msg.id()) == Some(produced.clone()));
        assert!(found, "seed {}: {} did not parse back", seed, produced);
    }
}

// ==================== Alternatives ====================

#[test]
fn alt_yields_every_matching_branch_in_declaration_order() {
    let branches = ["00", "0044", "0", "004"];
    let alt = Variable::alt(
        "f2",
        branches.iter().map(|b| Variable::data(*b, Raw::fixed(b.as_bytes().to_vec()))).collect(),
    )
    .expect("alt");
    let data = BitString::from_bytes(b"0044");
    let lengths: Vec<usize> = parse(&alt, Path::new(), &data).map(|p| consumed(&p, &alt) / 8).collect();
    assert_eq!(lengths, vec![2, 4, 1, 3]);
}

#[test]
fn alt_after_fixed_field_consumes_the_rest() {
    let f1 = Variable::data("f1", Raw::fixed(b"22".to_vec()));
    let f2 = Variable::alt(
        "f2",
        ["00", "0044", "0", "004"].iter().map(|b| Variable::data(*b, Raw::fixed(b.as_bytes().to_vec()))).collect(),
    )
    .expect("alt");
    let f2_id = f2.id();
    let sym = symbol("S", vec![("f1", f1), ("f2", f2)]);
    let data = BitString::from_bytes(b"220044");
    let mut memory = Memory::new();
    let message = MessageParser::new(&sym).parse(&data, &mut memory).expect("parse");
    assert_eq!(message.field("f2"), Some(&BitString::from_bytes(b"0044")));
    let paths: Vec<Path> = MessageParser::new(&sym).paths(&data, &memory).collect();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].bits(f2_id), Some(BitString::from_bytes(b"0044")));
}

#[test]
fn alt_with_single_match_yields_one_path() {
    let alt = Variable::alt(
        "alt",
        vec![Variable::data("x", Raw::fixed(b"x".to_vec())), Variable::data("yy", Raw::fixed(b"yy".to_vec()))],
    )
    .expect("alt");
    assert_eq!(parse(&alt, Path::new(), &BitString::from_bytes(b"yy")).count(), 1);
    assert_eq!(parse(&alt, Path::new(), &BitString::from_bytes(b"zz")).count(), 0);
}

// ==================== Repetitions ====================

#[test]
fn repeat_with_delimiter_places_delimiters_between_instances() {
    let ips = Variable::repeat(
        "ips",
        Variable::data("ip", Ipv4::new()),
        RepeatCount::exactly(3),
        Some(BitString::from_bytes(b";")),
    )
    .expect("repeat");
    for seed in 0..16 {
        let bytes = specialize_one(&ips, seed).bits(ips.id()).expect("bits").to_bytes();
        assert_eq!(bytes.len(), 14);
        assert_eq!(bytes[4], b';');
        assert_eq!(bytes[9], b';');
    }
}

#[test]
fn repeat_counts_are_tried_in_ascending_order() {
    let r = Variable::repeat("r", Variable::data("c", Raw::exact(1)), RepeatCount::new(0, 3), Some(BitString::from_bytes(b",")))
        .expect("repeat");
    let data = BitString::from_bytes(b"a,b");
    let counts: Vec<usize> = parse(&r, Path::new(), &data).map(|p| consumed(&p, &r) / 8).collect();
    assert_eq!(counts, vec![0, 1, 3]);
}

#[test]
fn persistent_child_repeats_its_first_value() {
    let child = Variable::data("c", Raw::exact(1)).with_svas(Svas::Persistent);
    let r = Variable::repeat("r", child, RepeatCount::exactly(3), None).expect("repeat");
    assert_eq!(parse(&r, Path::new(), &BitString::from_bytes(b"aaa")).count(), 1);
    assert_eq!(parse(&r, Path::new(), &BitString::from_bytes(b"abc")).count(), 0);
    let bytes = specialize_one(&r, 3).bits(r.id()).expect("bits").to_bytes();
    assert!(bytes.iter().all(|b| *b == bytes[0]));
}

// ==================== Relations ====================

#[test]
fn size_counts_bytes_of_its_target() {
    let payload = Variable::data("payload", Raw::exact(5));
    let len = Variable::size("len", &[&payload], Integer::uint16()).expect("size");
    let len_id = len.id();
    let msg = Variable::agg("msg", vec![len, payload]).expect("agg");
    let path = specialize_one(&msg, 9);
    assert_eq!(path.bits(len_id), Some(BitString::from_bytes(&[0, 5])));
    assert_eq!(path.measure(msg.id()), Some(7 * 8));
}

#[test]
fn size_holds_for_variable_payloads() {
    let payload = Variable::data("payload", Raw::sized(0, Some(40)).expect("raw"));
    let len = Variable::size("len", &[&payload], Integer::uint8()).expect("size");
    let (len_id, payload_id) = (len.id(), payload.id());
    let msg = Variable::agg("msg", vec![len, payload]).expect("agg");
    for seed in 0..16 {
        let path = specialize_one(&msg, seed);
        let size = path.bits(len_id).and_then(|b| b.to_uint()).expect("size value");
        let payload_bits = path.bits(payload_id).expect("payload").len();
        assert_eq!(size as usize * 8, payload_bits);
    }
}

#[test]
fn hmac_md5_test_vector() {
    let f1 = Variable::data("f1", Raw::fixed(vec![0xaa, 0xbb]));
    let mac = Variable::hmac("mac", &[&f1], "md5", b"1234".to_vec()).expect("hmac");
    let msg = Variable::agg("msg", vec![f1, mac]).expect("agg");
    let bytes = specialize_one(&msg, 0).bits(msg.id()).expect("bits").to_bytes();
    assert_eq!(hex::encode(bytes), "aabbb71c98baa40dc8a49361816d5dc1eb25");
}

#[test]
fn hmac_sha1_96_truncates_to_twelve_bytes() {
    let f1 = Variable::data("f1", Raw::fixed(vec![0xaa, 0xbb]));
    let mac = Variable::hmac("mac", &[&f1], "sha1-96", b"1234".to_vec()).expect("hmac");
    let msg = Variable::agg("msg", vec![f1, mac]).expect("agg");
    let bytes = specialize_one(&msg, 0).bits(msg.id()).expect("bits").to_bytes();
    assert_eq!(bytes.len(), 2 + 12);
    let full = hmac_digest(HashAlgorithm::Sha1, b"1234", &[0xaa, 0xbb]).expect("digest");
    assert_eq!(full.len(), 20);
    assert_eq!(&bytes[2..], &full[..12]);
}

#[test]
fn value_copies_its_target_in_every_message() {
    let f2 = Variable::data("f2", Raw::sized(1, Some(10)).expect("raw"));
    let f4 = Variable::value("f4", &f2).expect("value");
    let sym = symbol("S", vec![("f2", f2), ("f4", f4)]);
    let mut rng = Pcg64::seed_from_u64(5);
    let mut memory = Memory::new();
    let mut specializer = MessageSpecializer::new(&mut rng);
    for _ in 0..16 {
        let message = specializer.specialize(&sym, &mut memory).expect("specialize");
        assert_eq!(message.field("f4"), message.field("f2"));
    }
}

#[test]
fn forward_value_is_patched_and_parses_back() {
    let f2 = Variable::data("f2", Raw::sized(1, Some(4)).expect("raw"));
    let copy = Variable::value("copy", &f2).expect("value");
    let sym = symbol("S", vec![("copy", copy), ("f2", f2)]);
    let mut rng = Pcg64::seed_from_u64(8);
    let mut memory = Memory::new();
    let message = MessageSpecializer::new(&mut rng).specialize(&sym, &mut memory).expect("specialize");
    assert_eq!(message.field("copy"), message.field("f2"));
    let parsed = MessageParser::new(&sym).parse(&message.bits(), &mut memory).expect("parse");
    assert_eq!(parsed, message);
}

#[test]
fn mismatching_checksum_is_no_match() {
    let body = Variable::data("body", Raw::exact(4));
    let crc = Variable::crc32("crc", &[&body]).expect("crc32");
    let sym = symbol("S", vec![("body", body), ("crc", crc)]);
    let mut data = b"1234".to_vec();
    data.extend_from_slice(&protodomain::relation::crc32(b"1234").to_be_bytes());
    let mut memory = Memory::new();
    assert!(MessageParser::new(&sym).parse(&BitString::from(data.clone()), &mut memory).is_some());
    data[5] ^= 0xff;
    assert!(MessageParser::new(&sym).parse(&BitString::from(data), &mut memory).is_none());
}

#[test]
fn relation_on_missing_variable_is_unresolvable() {
    let head = Variable::data("head", Raw::fixed(vec![0x45, 0x00]));
    let missing = Variable::data("missing", Raw::exact(2));
    let sum = Variable::internet_checksum("sum", &[&head, &missing]).expect("checksum");
    let sym = symbol("S", vec![("head", head), ("sum", sum)]);
    let mut rng = Pcg64::seed_from_u64(1);
    let err = MessageSpecializer::new(&mut rng).specialize(&sym, &mut Memory::new()).unwrap_err();
    assert!(matches!(err, EngineError::UnresolvableRelation { ref name } if name == "sum"), "{:?}", err);
}

// ==================== Memory ====================

#[test]
fn memory_persists_and_forgets() {
    let v = Variable::data("v", Raw::exact(2));
    let mut memory = Memory::new();
    let x = BitString::from_bytes(b"hi");
    memory.memorize(v.id(), x.clone());
    assert_eq!(memory.recall(v.id()), None);
    memory.persist();
    assert_eq!(memory.recall(v.id()), Some(&x));
    assert_eq!(memory.recall(v.id()), Some(&x));
    memory.forget(v.id());
    assert_eq!(memory.recall(v.id()), None);
}

#[test]
fn failed_parse_leaves_memory_untouched() {
    let v = Variable::data("v", Raw::exact(2));
    let v_id = v.id();
    let end = Variable::data("end", Raw::fixed(b"!".to_vec()));
    let sym = symbol("S", vec![("v", v), ("end", end)]);
    let mut memory = Memory::new();
    assert!(MessageParser::new(&sym).parse(&BitString::from_bytes(b"ab?"), &mut memory).is_none());
    assert!(memory.is_empty());
    assert!(MessageParser::new(&sym).parse(&BitString::from_bytes(b"ab!"), &mut memory).is_some());
    assert_eq!(memory.recall(v_id), Some(&BitString::from_bytes(b"ab")));
}

#[test]
fn persistent_leaf_is_replayed_across_messages() {
    let token = Variable::data("token", Raw::exact(4)).with_svas(Svas::Persistent);
    let sym = symbol("S", vec![("token", token)]);
    let mut rng = Pcg64::seed_from_u64(11);
    let mut memory = Memory::new();
    let mut specializer = MessageSpecializer::new(&mut rng);
    let first = specializer.specialize(&sym, &mut memory).expect("first");
    let second = specializer.specialize(&sym, &mut memory).expect("second");
    assert_eq!(first, second);
    // A different token no longer parses once the first one is known.
    let mut other = first.to_bytes();
    other[0] ^= 1;
    assert!(MessageParser::new(&sym).parse(&BitString::from(other), &mut memory).is_none());
}

#[test]
fn constant_without_value_yields_nothing() {
    let v = Variable::data("v", Raw::exact(1)).with_svas(Svas::Constant);
    assert_eq!(parse(&v, Path::new(), &BitString::from_bytes(b"a")).count(), 0);
    let sym = symbol("S", vec![("v", v)]);
    let mut rng = Pcg64::seed_from_u64(0);
    let err = MessageSpecializer::new(&mut rng).specialize(&sym, &mut Memory::new()).unwrap_err();
    assert!(matches!(err, EngineError::NoSpecialization { ref field } if field == "v"), "{:?}", err);
}

// ==================== Construction errors ====================

#[test]
fn invalid_trees_are_rejected_at_construction() {
    assert!(Variable::alt("a", Vec::new()).is_err());
    assert!(Variable::agg("a", Vec::new()).is_err());
    let child = || Variable::data("c", Raw::exact(1));
    assert!(Variable::repeat("r", child(), RepeatCount::new(3, 3), None).is_err());
    assert!(Variable::repeat("r", child(), RepeatCount::new(0, 1001), None).is_err());
    assert!(Variable::hmac("h", &[&child()], "whirlpool", b"k".to_vec()).is_err());
    assert!(Variable::size("s", &[], Integer::uint8()).is_err());
}

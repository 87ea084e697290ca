//! Abstraction fuzz target: arbitrary bytes against a fixed grammar. Parsing
//! may reject the input but must not panic.
//! Build with: cargo fuzz run abstract_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
const GRAMMAR: &str = r#"
symbol "Frame" {
    kind: alt(uint8(1), uint8(2));
    len: size(items, type = uint8());
    items: repeat(alt(ipv4(), raw(0x00)), 0..4, delimiter = ";");
    pad: padding(kind, len, items, modulo = 32);
    sum: internet_checksum(kind, len, items, pad);
}
"#;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    let Ok(symbols) = protodomain::parse(GRAMMAR) else {
        return;
    };
    let mut session = protodomain::Session::new(protodomain::SessionConfig::default().with_seed(0));
    let _ = session.abstract_message(&symbols, data);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run abstract_fuzz");
}

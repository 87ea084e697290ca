use anyhow::Context;
use clap::Parser;
use pcap_parser::pcapng::Block as PcapNgBlock;
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::{Linktype, PcapBlockOwned, PcapError};
use protodomain::{parse, Message, Session, SessionConfig, Symbol, Value};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Abstract every UDP payload of a capture against the symbols of a grammar.
#[derive(Debug, Parser)]
#[command(name = "abstract_pcap")]
struct Args {
    /// Grammar file describing the symbols.
    grammar: PathBuf,
    /// Capture file (pcap or pcapng).
    capture: PathBuf,
    /// Print the fields of every abstracted message.
    #[arg(short, long)]
    verbose: bool,
    /// Do not let one message's learned values constrain the next ones.
    #[arg(long)]
    no_memory: bool,
}

#[derive(Debug, Default)]
struct Stats {
    packets: u64,
    udp: u64,
    unknown: u64,
    by_symbol: BTreeMap<String, u64>,
}

struct Abstractor {
    symbols: Vec<Symbol>,
    session: Session,
    verbose: bool,
    stats: Stats,
}

impl Abstractor {
    fn process_udp_payload(&mut self, payload: &[u8]) {
        self.stats.udp += 1;
        match self.session.abstract_message(&self.symbols, payload) {
            Some(message) => {
                if self.verbose {
                    print_message(self.stats.packets, &message);
                }
                *self.stats.by_symbol.entry(message.symbol).or_insert(0) += 1;
            }
            None => {
                self.stats.unknown += 1;
                if self.verbose {
                    let show = payload.len().min(16);
                    println!("packet {}: no symbol (first {} bytes: {})", self.stats.packets, show, hex::encode(&payload[..show]));
                }
            }
        }
    }
}

fn print_message(packet: u64, message: &Message) {
    println!("packet {}: {}", packet, message.symbol);
    for field in &message.fields {
        println!("  {:>5}  {}: {}", field.offset / 8, field.name, Value::symbol_key(&field.bits));
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let src = std::fs::read_to_string(&args.grammar)
        .with_context(|| format!("reading grammar {}", args.grammar.display()))?;
    let symbols = parse(&src).with_context(|| format!("parsing grammar {}", args.grammar.display()))?;
    let config = SessionConfig::default().with_persist(!args.no_memory);
    let mut abstractor = Abstractor { symbols, session: Session::new(config), verbose: args.verbose, stats: Stats::default() };

    // pcap vs pcapng, from the magic at the start of the file.
    let mut magic = [0u8; 4];
    {
        let mut f = File::open(&args.capture).with_context(|| format!("opening {}", args.capture.display()))?;
        f.read_exact(&mut magic)?;
    }
    let file = File::open(&args.capture)?;
    if magic == [0x0a, 0x0d, 0x0d, 0x0a] {
        run_pcapng(file, &mut abstractor)?;
    } else {
        run_legacy_pcap(file, &mut abstractor)?;
    }

    let stats = &abstractor.stats;
    eprintln!("capture: {}", args.capture.display());
    eprintln!("grammar: {}", args.grammar.display());
    eprintln!("packets: {}", stats.packets);
    eprintln!("udp payloads: {}", stats.udp);
    eprintln!("unknown: {}", stats.unknown);
    if !stats.by_symbol.is_empty() {
        eprintln!("symbols:");
        for (name, n) in &stats.by_symbol {
            eprintln!("  {}: {}", name, n);
        }
    }
    Ok(())
}

fn run_legacy_pcap<R: Read>(file: R, abstractor: &mut Abstractor) -> anyhow::Result<()> {
    let mut reader = pcap_parser::pcap::LegacyPcapReader::new(1 << 20, file)?;
    let mut linktype: Option<Linktype> = None;
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(h) => linktype = Some(h.network),
                    PcapBlockOwned::Legacy(b) => {
                        abstractor.stats.packets += 1;
                        let lt = linktype.unwrap_or(Linktype(1));
                        if let Some(payload) = udp_payload_from_linktype(lt, b.data) {
                            abstractor.process_udp_payload(payload);
                        }
                    }
                    PcapBlockOwned::NG(_) => {}
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| anyhow::anyhow!("pcap refill error: {:?}", e))?;
            }
            Err(e) => return Err(anyhow::anyhow!("pcap read error: {:?}", e)),
        }
    }
    Ok(())
}

fn run_pcapng<R: Read>(file: R, abstractor: &mut Abstractor) -> anyhow::Result<()> {
    let mut reader = pcap_parser::pcapng::PcapNGReader::new(1 << 20, file)?;
    let mut if_linktypes: Vec<Linktype> = Vec::new();
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                if let PcapBlockOwned::NG(b) = block {
                    match &b {
                        PcapNgBlock::InterfaceDescription(idb) => if_linktypes.push(idb.linktype),
                        PcapNgBlock::EnhancedPacket(epb) => {
                            abstractor.stats.packets += 1;
                            let lt = if_linktypes.get(epb.if_id as usize).copied().unwrap_or(Linktype(1));
                            if let Some(payload) = udp_payload_from_linktype(lt, epb.packet_data()) {
                                abstractor.process_udp_payload(payload);
                            }
                        }
                        PcapNgBlock::SimplePacket(spb) => {
                            abstractor.stats.packets += 1;
                            let lt = if_linktypes.first().copied().unwrap_or(Linktype(1));
                            if let Some(payload) = udp_payload_from_linktype(lt, spb.packet_data()) {
                                abstractor.process_udp_payload(payload);
                            }
                        }
                        _ => {}
                    }
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| anyhow::anyhow!("pcapng refill error: {:?}", e))?;
            }
            Err(e) => return Err(anyhow::anyhow!("pcapng read error: {:?}", e)),
        }
    }
    Ok(())
}

/// UDP payload of a captured frame, bounded by the IPv4 and UDP length fields
/// so Ethernet padding is left out.
fn udp_payload_from_linktype(linktype: Linktype, frame: &[u8]) -> Option<&[u8]> {
    let l3 = match linktype.0 {
        1 => ethernet_l3(frame)?,    // DLT_EN10MB
        101 => frame,                // DLT_RAW
        113 => linux_sll_l3(frame)?, // DLT_LINUX_SLL
        _ => return None,
    };
    ipv4_udp_payload(l3)
}

fn ethernet_l3(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 14 {
        return None;
    }
    let mut off = 12usize;
    let mut ethertype = u16::from_be_bytes([frame[off], frame[off + 1]]);
    off += 2;
    // 802.1Q / 802.1ad tags
    while ethertype == 0x8100 || ethertype == 0x88a8 {
        if frame.len() < off + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[off + 2], frame[off + 3]]);
        off += 4;
    }
    (ethertype == 0x0800).then(|| &frame[off..])
}

fn linux_sll_l3(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 16 {
        return None;
    }
    let proto = u16::from_be_bytes([frame[14], frame[15]]);
    (proto == 0x0800).then(|| &frame[16..])
}

fn ipv4_udp_payload(l3: &[u8]) -> Option<&[u8]> {
    if l3.len() < 20 || l3[0] >> 4 != 4 {
        return None;
    }
    let ihl = (l3[0] & 0x0f) as usize * 4;
    let total_len = u16::from_be_bytes([l3[2], l3[3]]) as usize;
    if ihl < 20 || l3.len() < ihl || total_len < ihl {
        return None;
    }
    let l3 = if total_len <= l3.len() { &l3[..total_len] } else { l3 };
    if l3.len() < ihl + 8 || l3[9] != 17 {
        return None;
    }
    let udp = &l3[ihl..];
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < 8 || udp.len() < udp_len {
        return None;
    }
    Some(&udp[8..udp_len])
}

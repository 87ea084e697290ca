//! Relation computation: size fields, copies, checksums, keyed digests and
//! padding, evaluated against the values a path holds.

use crate::bits::BitString;
use crate::domain::{HashAlgorithm, Relation, RelationKind};
use crate::error::EngineError;
use crate::path::Path;
use crate::value::Value;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use tracing::{debug, trace};

/// Outcome of evaluating a relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Computed {
    Ready(BitString),
    /// Only the length is determined (padding with a free pad unit).
    Length(usize),
    /// Some target has no value yet.
    Waiting,
}

/// Evaluate `rel` against `path`.
pub fn compute(rel: &Relation, path: &Path) -> Result<Computed, EngineError> {
    let own_len = path.cell(rel.id()).and_then(|c| c.len).or_else(|| fixed_len(rel));
    match rel.kind() {
        RelationKind::Size { factor, offset } => {
            let Some(total) = target_lengths(rel, path, own_len) else {
                return Ok(Computed::Waiting);
            };
            let size = (total as f64 * factor + *offset as f64).trunc() as i128;
            let bits = rel
                .data_type()
                .decode(&Value::Int(size))
                .map_err(|e| EngineError::relation(rel.name(), e.to_string()))?;
            Ok(Computed::Ready(bits))
        }
        RelationKind::Value => {
            let [target] = rel.targets() else {
                return Err(EngineError::relation(rel.name(), "value relation needs exactly one target"));
            };
            if *target == rel.id() {
                return Err(EngineError::relation(rel.name(), "value relation cannot copy itself"));
            }
            Ok(path
                .target_bits(*target, Some(rel.id()))
                .map_or(Computed::Waiting, Computed::Ready))
        }
        RelationKind::InternetChecksum => {
            let Some(data) = gather(rel, path, own_len) else {
                return Ok(Computed::Waiting);
            };
            let sum = internet_checksum(&data.to_bytes());
            encode_int(rel, i128::from(sum))
        }
        RelationKind::Crc32 => {
            let Some(data) = gather(rel, path, own_len) else {
                return Ok(Computed::Waiting);
            };
            encode_int(rel, i128::from(crc32(&data.to_bytes())))
        }
        RelationKind::Hmac { algorithm, key } => {
            let Some(data) = gather(rel, path, own_len) else {
                return Ok(Computed::Waiting);
            };
            let digest = hmac_digest(*algorithm, key, &data.to_bytes())
                .map_err(|e| EngineError::relation(rel.name(), e))?;
            Ok(Computed::Ready(BitString::from(digest)))
        }
        RelationKind::Padding { modulo, once, factor, offset } => {
            let Some(total) = target_lengths(rel, path, Some(0)) else {
                return Ok(Computed::Waiting);
            };
            let size = ((total as f64 * factor + *offset as f64).trunc() as i64).max(0) as usize;
            let rem = size % modulo;
            let mut pad = if rem > 0 { modulo - rem } else { 0 };
            if *once && size > *modulo {
                pad = 0;
            }
            let pad_bits = (pad as f64 / factor) as usize;
            match rel.data_type().value() {
                Some(unit) => Ok(Computed::Ready(repeat_unit(&unit, pad_bits))),
                None => Ok(Computed::Length(pad_bits)),
            }
        }
    }
}

/// Fill `len` bits with values of the relation's data type (for padding whose
/// pad unit is free).
pub fn fill(rel: &Relation, len: usize, rng: &mut dyn RngCore) -> BitString {
    let mut out = BitString::new();
    while out.len() < len {
        let unit = rel.data_type().generate(rng, len);
        if unit.is_empty() {
            break;
        }
        out.extend(&unit);
    }
    let mut out = out.slice(0, len);
    while out.len() < len {
        out.push(false);
    }
    out
}

/// Candidate lengths for a relation slot found before its value is computable.
pub fn candidate_lengths(rel: &Relation, remaining: usize) -> Vec<usize> {
    match rel.kind() {
        RelationKind::Padding { modulo, factor, .. } => {
            let unit = rel.data_type().size().0.max(1);
            let top = ((*modulo as f64 / factor) as usize).min(remaining);
            (0..=top).rev().filter(|l| l % unit == 0).collect()
        }
        _ => rel.data_type().lengths(remaining),
    }
}

/// Whether parsed `bits` could hold the value of `rel` once it is computable.
pub fn plausible(rel: &Relation, bits: &BitString) -> bool {
    match rel.kind() {
        RelationKind::Padding { .. } => match rel.data_type().value() {
            Some(unit) => repeat_unit(&unit, bits.len()) == *bits,
            None => true,
        },
        _ => rel.data_type().can_parse(bits),
    }
}

/// Re-evaluate the pending relations of a parsed path. Returns false when a
/// parsed value disagrees with what its relation computes.
pub fn settle_parsed(path: &mut Path) -> bool {
    for rel in path.pending().to_vec() {
        let parsed = path.cell(rel.id()).cloned();
        let ok = match compute(&rel, path) {
            Ok(Computed::Waiting) => continue,
            Ok(Computed::Ready(expected)) => parsed.and_then(|c| c.bits).as_ref() == Some(&expected),
            Ok(Computed::Length(n)) => parsed.and_then(|c| c.len) == Some(n),
            Err(e) => {
                debug!(relation = rel.name(), error = %e, "relation not computable on parsed data");
                false
            }
        };
        if !ok {
            debug!(relation = rel.name(), "parsed value does not satisfy relation");
            return false;
        }
        trace!(relation = rel.name(), "relation verified");
        path.remove_pending(rel.id());
    }
    true
}

/// Resolve pending relations of a path under specialization until no more
/// progress is possible; placeholders are overwritten with computed values.
pub fn settle_specialized(path: &mut Path, rng: &mut dyn RngCore) -> Result<(), EngineError> {
    loop {
        let mut progress = false;
        for rel in path.pending().to_vec() {
            let bits = match compute(&rel, path)? {
                Computed::Waiting => continue,
                Computed::Ready(bits) => bits,
                Computed::Length(n) => fill(&rel, n, rng),
            };
            trace!(relation = rel.name(), value = %bits, "placeholder replaced");
            path.set_cell(rel.id(), Some(bits), None);
            path.remove_pending(rel.id());
            progress = true;
        }
        if !progress {
            return Ok(());
        }
    }
}

fn fixed_len(rel: &Relation) -> Option<usize> {
    match rel.data_type().size() {
        (min, Some(max)) if min == max => Some(min),
        _ => None,
    }
}

fn target_lengths(rel: &Relation, path: &Path, own_len: Option<usize>) -> Option<usize> {
    rel.targets().iter().try_fold(0usize, |acc, t| {
        let len = if *t == rel.id() { own_len? } else { path.target_len(*t)? };
        Some(acc + len)
    })
}

fn gather(rel: &Relation, path: &Path, own_len: Option<usize>) -> Option<BitString> {
    let mut out = BitString::new();
    for t in rel.targets() {
        if *t == rel.id() {
            out.extend(&BitString::zeros(own_len?));
        } else {
            out.extend(&path.target_bits(*t, Some(rel.id()))?);
        }
    }
    Some(out)
}

fn encode_int(rel: &Relation, v: i128) -> Result<Computed, EngineError> {
    rel.data_type()
        .decode(&Value::Int(v))
        .map(Computed::Ready)
        .map_err(|e| EngineError::relation(rel.name(), e.to_string()))
}

fn repeat_unit(unit: &BitString, len: usize) -> BitString {
    let mut out = BitString::new();
    while out.len() < len && !unit.is_empty() {
        out.extend(unit);
    }
    out.slice(0, len)
}

/// RFC 1071 one's complement sum over big-endian 16-bit words.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// CRC-32 (IEEE 802.3, reflected polynomial 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for byte in data {
        crc ^= u32::from(*byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

fn keyed<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac = <M as KeyInit>::new_from_slice(key).map_err(|e| e.to_string())?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hmac_digest(algorithm: HashAlgorithm, key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut digest = match algorithm {
        HashAlgorithm::Md5 => keyed::<Hmac<Md5>>(key, data)?,
        HashAlgorithm::Sha1 | HashAlgorithm::Sha1_96 => keyed::<Hmac<Sha1>>(key, data)?,
        HashAlgorithm::Sha224 => keyed::<Hmac<Sha224>>(key, data)?,
        HashAlgorithm::Sha256 => keyed::<Hmac<Sha256>>(key, data)?,
        HashAlgorithm::Sha384 => keyed::<Hmac<Sha384>>(key, data)?,
        HashAlgorithm::Sha512 => keyed::<Hmac<Sha512>>(key, data)?,
    };
    digest.truncate(algorithm.digest_len());
    Ok(digest)
}

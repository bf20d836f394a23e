//! Reed-Solomon fragment coding.
//!
//! A chunk is split into `data` shards and extended with `parity` shards.
//! All shards share one size, padded to an even length as
//! `reed-solomon-simd` requires.

use bytes::Bytes;
use tide_types::RedundancyScheme;
use tracing::debug;

use crate::error::StoreError;

/// Encode `chunk` into `scheme.total()` shards, data shards first.
pub fn encode(scheme: RedundancyScheme, chunk: &[u8]) -> Result<Vec<Bytes>, StoreError> {
    let k = scheme.required();
    let m = scheme.tolerance();
    let shard_size = round_up_even(chunk.len().div_ceil(k).max(1));

    let mut padded = Vec::with_capacity(k * shard_size);
    padded.extend_from_slice(chunk);
    padded.resize(k * shard_size, 0);

    let originals: Vec<&[u8]> = padded.chunks_exact(shard_size).collect();
    let recovery = reed_solomon_simd::encode(k, m, &originals)?;

    let mut shards = Vec::with_capacity(k + m);
    shards.extend(originals.iter().map(|s| Bytes::copy_from_slice(s)));
    shards.extend(recovery.into_iter().map(Bytes::from));

    debug!(k, m, len = chunk.len(), shard_size, "encoded chunk");
    Ok(shards)
}

/// Rebuild shard `target` from `available` `(index, shard)` pairs.
pub fn rebuild(
    scheme: RedundancyScheme,
    available: &[(usize, Bytes)],
    target: usize,
) -> Result<Bytes, StoreError> {
    let k = scheme.required();
    let m = scheme.tolerance();

    if let Some((_, shard)) = available.iter().find(|(i, _)| *i == target) {
        return Ok(shard.clone());
    }
    if available.len() < k {
        return Err(StoreError::InsufficientFragments {
            needed: k,
            got: available.len(),
        });
    }

    let mut originals: Vec<Option<Bytes>> = vec![None; k];
    let mut recovery: Vec<(usize, &[u8])> = Vec::new();
    for (index, shard) in available {
        if *index < k {
            originals[*index] = Some(shard.clone());
        } else if *index < k + m {
            recovery.push((*index - k, shard.as_ref()));
        }
    }

    if originals.iter().any(Option::is_none) {
        let present: Vec<(usize, &[u8])> = originals
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (i, s.as_ref())))
            .collect();
        let restored = reed_solomon_simd::decode(k, m, present, recovery)?;
        for (index, shard) in restored {
            originals[index] = Some(Bytes::from(shard));
        }
    }

    let originals: Vec<Bytes> = originals.into_iter().flatten().collect();
    if originals.len() != k {
        return Err(StoreError::InsufficientFragments {
            needed: k,
            got: originals.len(),
        });
    }

    debug!(k, m, target, "rebuilt shard");
    if target < k {
        return Ok(originals[target].clone());
    }
    let parity = reed_solomon_simd::encode(k, m, &originals)?;
    parity
        .into_iter()
        .nth(target - k)
        .map(Bytes::from)
        .ok_or(StoreError::InsufficientFragments { needed: k, got: 0 })
}

/// Reassemble the original chunk from the `data` shards.
pub fn join(scheme: RedundancyScheme, shards: &[Bytes], len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = shards
        .iter()
        .take(scheme.required())
        .flat_map(|s| s.iter().copied())
        .collect();
    out.truncate(len);
    out
}

fn round_up_even(n: usize) -> usize {
    if n.is_multiple_of(2) { n } else { n + 1 }
}

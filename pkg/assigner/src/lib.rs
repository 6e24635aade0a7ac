//! Rendezvous (highest-random-weight) assignment of sessions to instances.
//!
//! Pure functions, no I/O: every instance computes the same answer from the
//! same live set, so no coordinator is needed to agree on a partitioning.
//! Adding or removing one instance only moves the sessions whose top-weight
//! instance changed.

/// Weight of `instance_id` for `session_id`. The two inputs are hashed
/// separately so that `("ab", "c")` and `("a", "bc")` do not collide.
pub fn weight(session_id: &str, instance_id: &str) -> u64 {
    let session_hash = fnv1a64(session_id.as_bytes());
    let instance_hash = fnv1a64(instance_id.as_bytes());
    mix64(instance_hash ^ mix64(session_hash))
}

/// The preferred owner of `session_id` among `live_instance_ids`, or `None`
/// when the live set is empty.
///
/// Ties (equal weights) resolve to the lexicographically smallest ID so the
/// result never depends on the order of the input slice.
pub fn preferred_owner<'a, S: AsRef<str>>(
    session_id: &str,
    live_instance_ids: &'a [S],
) -> Option<&'a str> {
    let mut best: Option<(u64, &str)> = None;
    for candidate in live_instance_ids {
        let id = candidate.as_ref();
        let score = weight(session_id, id);
        best = match best {
            None => Some((score, id)),
            Some((cur, cur_id)) if score > cur || (score == cur && id < cur_id) => {
                Some((score, id))
            }
            keep => keep,
        };
    }
    best.map(|(_, id)| id)
}

/// Sessions out of `session_ids` whose preferred owner is `instance_id`.
pub fn sessions_for_instance<'a, S: AsRef<str>>(
    session_ids: &'a [S],
    instance_id: &str,
    live_instance_ids: &[S],
) -> Vec<&'a str> {
    session_ids
        .iter()
        .map(|s| s.as_ref())
        .filter(|s| preferred_owner(s, live_instance_ids) == Some(instance_id))
        .collect()
}

fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001B3;
    let mut hash = FNV_OFFSET;
    for b in data {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

// splitmix64 finalizer; FNV alone clusters badly on short, similar IDs.
fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

// Copyright (c) Facebook, Inc. and its affiliates.
//
// Maps the cores available to batch jobs onto the heads of the tier queues.
//
// Each head demands min(threads, capacity) cores where capacity is the most
// cores batch jobs can ever get. A head whose thread count fits in capacity
// only runs with its full demand. A head which asks for more than capacity
// can be squeezed down to a single core. A paused head is resumed only with
// its full demand.
//
// Counts are handed out top-down in priority order, so cores are always
// taken away from the lowest priority head first. Concrete cores are then
// picked so that each head keeps as much of its current or preferred set as
// possible and the rest is filled from the lowest free cores.
use cs_agent_intf::CoreSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub threads: usize,
    /// Cores the head runs on, or would like to run on if it isn't running.
    pub cores: CoreSet,
    pub paused: bool,
    /// The head's state couldn't be determined. `cores` are left alone.
    pub frozen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Keep,
    Hold,
    Run(CoreSet),
}

fn demand(threads: usize, capacity: usize) -> usize {
    threads.min(capacity).max(1)
}

fn need(claim: &Claim, capacity: usize) -> usize {
    let demand = demand(claim.threads, capacity);
    if claim.paused || claim.threads <= capacity {
        demand
    } else {
        1
    }
}

/// `claims` must be in priority order, highest first.
pub fn plan(avail: CoreSet, capacity: usize, claims: &[Claim]) -> Vec<Grant> {
    let mut pool = avail;
    for claim in claims.iter().filter(|c| c.frozen) {
        pool -= claim.cores;
    }

    let mut remaining = pool.len();
    let counts: Vec<Option<usize>> = claims
        .iter()
        .map(|claim| {
            if claim.frozen {
                return None;
            }
            if remaining >= need(claim, capacity) {
                let cnt = demand(claim.threads, capacity).min(remaining);
                remaining -= cnt;
                Some(cnt)
            } else {
                None
            }
        })
        .collect();

    let mut free = pool;
    let mut sets = vec![CoreSet::new(); claims.len()];
    for (i, claim) in claims.iter().enumerate() {
        if let Some(cnt) = counts[i] {
            let keep = (claim.cores & free).lowest(cnt);
            free -= keep;
            sets[i] = keep;
        }
    }
    for i in 0..claims.len() {
        if let Some(cnt) = counts[i] {
            let fill = free.lowest(cnt - sets[i].len());
            free -= fill;
            sets[i] |= fill;
        }
    }

    claims
        .iter()
        .enumerate()
        .map(|(i, claim)| match (claim.frozen, counts[i]) {
            (true, _) => Grant::Keep,
            (false, Some(_)) => Grant::Run(sets[i]),
            (false, None) => Grant::Hold,
        })
        .collect()
}

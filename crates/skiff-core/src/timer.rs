// src/timer.rs
//! Idle-connection timers.
//!
//! Timers live in a [`Slab`] arena; a `BTreeSet` keyed by
//! `(expiry, sequence, key)` keeps them in ascending expiry order. Walking the
//! set from the front therefore yields non-decreasing expiries, and
//! [`TimerList::tick`] only ever has to look at the head.
//!
//! The list is owned and driven by the reactor thread alone, so it carries no
//! synchronization.

use std::collections::BTreeSet;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::slab::{Key, Slab};

/// Eviction capability handed to [`TimerList::tick`].
///
/// Called once per expired timer with the socket that timer was guarding.
pub trait Expire {
    fn expire(&mut self, fd: RawFd);
}

impl<F: FnMut(RawFd)> Expire for F {
    fn expire(&mut self, fd: RawFd) {
        self(fd)
    }
}

struct Timer {
    expire: Instant,
    seq: u64,
    fd: RawFd,
}

/// Non-owning handle to a timer inside a [`TimerList`].
///
/// Goes stale once the timer fires or is deleted; stale handles are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(Key);

pub struct TimerList {
    timers: Slab<Timer>,
    order: BTreeSet<(Instant, u64, Key)>,
    next_seq: u64,
}

impl TimerList {
    pub fn new(capacity: usize) -> Self {
        Self {
            timers: Slab::new(capacity),
            order: BTreeSet::new(),
            next_seq: 0,
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert a timer for `fd`. Among equal expiries, later additions sort
    /// after earlier ones. Returns `None` when the arena is full.
    pub fn add(&mut self, expire: Instant, fd: RawFd) -> Option<TimerId> {
        let seq = self.bump_seq();
        let key = self.timers.insert(Timer { expire, seq, fd })?;
        self.order.insert((expire, seq, key));
        Some(TimerId(key))
    }

    /// Push a timer's expiry later and re-splice it.
    ///
    /// Moving a timer earlier is refused and returns `false`, as does a stale
    /// handle.
    pub fn adjust(&mut self, id: TimerId, expire: Instant) -> bool {
        let seq = self.bump_seq();
        let Some(timer) = self.timers.get_mut(id.0) else {
            return false;
        };
        if expire < timer.expire {
            return false;
        }

        self.order.remove(&(timer.expire, timer.seq, id.0));
        timer.expire = expire;
        timer.seq = seq;
        self.order.insert((expire, seq, id.0));
        true
    }

    /// Unlink and release a timer without firing it.
    pub fn del(&mut self, id: TimerId) -> bool {
        match self.timers.remove(id.0) {
            Some(timer) => {
                self.order.remove(&(timer.expire, timer.seq, id.0));
                true
            }
            None => false,
        }
    }

    /// Fire and release every timer with `expiry <= now`, head first.
    /// Stops at the first timer still in the future. Returns how many fired.
    pub fn tick<E: Expire + ?Sized>(&mut self, now: Instant, handler: &mut E) -> usize {
        let mut fired = 0;
        while let Some(&(expire, _, key)) = self.order.first() {
            if expire > now {
                break;
            }
            self.order.pop_first();
            if let Some(timer) = self.timers.remove(key) {
                handler.expire(timer.fd);
                fired += 1;
            }
        }
        fired
    }

    pub fn expiry(&self, id: TimerId) -> Option<Instant> {
        self.timers.get(id.0).map(|t| t.expire)
    }

    /// Head-to-tail walk: `(expiry, fd)` in ascending expiry order.
    pub fn iter(&self) -> impl Iterator<Item = (Instant, RawFd)> + '_ {
        self.order.iter().filter_map(move |&(expire, _, key)| {
            self.timers.get(key).map(|t| (expire, t.fd))
        })
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn secs(base: Instant, s: u64) -> Instant {
        base + Duration::from_secs(s)
    }

    fn assert_sorted(list: &TimerList) {
        let expiries: Vec<Instant> = list.iter().map(|(e, _)| e).collect();
        assert!(
            expiries.windows(2).all(|w| w[0] <= w[1]),
            "timer list out of order"
        );
        assert_eq!(expiries.len(), list.len());
    }

    fn fds(list: &TimerList) -> Vec<RawFd> {
        list.iter().map(|(_, fd)| fd).collect()
    }

    #[test]
    fn add_keeps_ascending_order() {
        let base = Instant::now();
        let mut list = TimerList::new(8);
        list.add(secs(base, 5), 5).unwrap();
        list.add(secs(base, 1), 1).unwrap();
        list.add(secs(base, 9), 9).unwrap();
        list.add(secs(base, 3), 3).unwrap();

        assert_eq!(fds(&list), vec![1, 3, 5, 9]);
        assert_eq!(list.iter().next(), Some((secs(base, 1), 1)));
    }

    #[test]
    fn equal_expiries_keep_insertion_order() {
        let base = Instant::now();
        let mut list = TimerList::new(4);
        list.add(secs(base, 2), 10).unwrap();
        list.add(secs(base, 2), 11).unwrap();
        list.add(secs(base, 2), 12).unwrap();
        assert_eq!(fds(&list), vec![10, 11, 12]);
    }

    #[test]
    fn adjust_moves_later_only() {
        let base = Instant::now();
        let mut list = TimerList::new(4);
        let a = list.add(secs(base, 1), 1).unwrap();
        list.add(secs(base, 2), 2).unwrap();
        list.add(secs(base, 3), 3).unwrap();

        assert!(list.adjust(a, secs(base, 10)));
        assert_eq!(fds(&list), vec![2, 3, 1]);
        assert_eq!(list.expiry(a), Some(secs(base, 10)));

        // Earlier is refused and leaves the order untouched.
        assert!(!list.adjust(a, secs(base, 0)));
        assert_eq!(fds(&list), vec![2, 3, 1]);
        assert_sorted(&list);
    }

    #[test]
    fn adjust_within_gap_keeps_position() {
        let base = Instant::now();
        let mut list = TimerList::new(4);
        list.add(secs(base, 1), 1).unwrap();
        let b = list.add(secs(base, 2), 2).unwrap();
        list.add(secs(base, 8), 3).unwrap();

        assert!(list.adjust(b, secs(base, 5)));
        assert_eq!(fds(&list), vec![1, 2, 3]);
    }

    #[test]
    fn del_head_tail_interior_and_only() {
        let base = Instant::now();
        let mut list = TimerList::new(8);
        let a = list.add(secs(base, 1), 1).unwrap();
        let b = list.add(secs(base, 2), 2).unwrap();
        let c = list.add(secs(base, 3), 3).unwrap();
        let d = list.add(secs(base, 4), 4).unwrap();

        assert!(list.del(b)); // interior
        assert_eq!(fds(&list), vec![1, 3, 4]);
        assert!(list.del(a)); // head
        assert_eq!(fds(&list), vec![3, 4]);
        assert!(list.del(d)); // tail
        assert_eq!(fds(&list), vec![3]);
        assert!(list.del(c)); // only
        assert!(list.is_empty());
        assert_eq!(list.iter().next(), None);

        // Stale handles are harmless.
        assert!(!list.del(c));
        assert!(!list.adjust(a, secs(base, 9)));
    }

    #[test]
    fn tick_fires_exactly_the_expired_prefix() {
        let base = Instant::now();
        let mut list = TimerList::new(8);
        for s in [4u64, 1, 3, 6, 2, 5] {
            list.add(secs(base, s), s as RawFd).unwrap();
        }

        let mut fired = Vec::new();
        let n = list.tick(secs(base, 3), &mut |fd: RawFd| fired.push(fd));
        assert_eq!(n, 3);
        assert_eq!(fired, vec![1, 2, 3]);
        assert_eq!(fds(&list), vec![4, 5, 6]);

        // Nothing left in the past.
        fired.clear();
        assert_eq!(list.tick(secs(base, 3), &mut |fd: RawFd| fired.push(fd)), 0);
        assert!(fired.is_empty());
    }

    #[test]
    fn fired_timer_handle_goes_stale() {
        let base = Instant::now();
        let mut list = TimerList::new(2);
        let a = list.add(secs(base, 1), 7).unwrap();
        list.tick(secs(base, 1), &mut |_fd: RawFd| {});
        assert!(!list.del(a));
        assert_eq!(list.expiry(a), None);

        // The freed slot is reusable and the old handle does not alias it.
        let b = list.add(secs(base, 2), 8).unwrap();
        assert!(!list.adjust(a, secs(base, 9)));
        assert_eq!(list.expiry(b), Some(secs(base, 2)));
    }

    #[test]
    fn arena_capacity_bounds_additions() {
        let base = Instant::now();
        let mut list = TimerList::new(1);
        assert!(list.add(base, 1).is_some());
        assert!(list.add(base, 2).is_none());
    }

    struct Recorder(Vec<RawFd>);

    impl Expire for Recorder {
        fn expire(&mut self, fd: RawFd) {
            self.0.push(fd);
        }
    }

    #[test]
    fn random_operation_sequences_stay_sorted() {
        // Small LCG so the sequence is reproducible.
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u64
        };

        let base = Instant::now();
        let mut list = TimerList::new(64);
        let mut live: Vec<TimerId> = Vec::new();

        for round in 0..2000 {
            match next() % 4 {
                0 | 1 => {
                    if let Some(id) = list.add(secs(base, next() % 100), round) {
                        live.push(id);
                    }
                }
                2 if !live.is_empty() => {
                    let id = live[(next() as usize) % live.len()];
                    let later = list.expiry(id).unwrap() + Duration::from_secs(next() % 50);
                    assert!(list.adjust(id, later));
                }
                3 if !live.is_empty() => {
                    let id = live.swap_remove((next() as usize) % live.len());
                    assert!(list.del(id));
                }
                _ => {}
            }
            assert_sorted(&list);
        }

        // A tick removes exactly the prefix at or before `now`.
        let now = secs(base, 60);
        let expected_left = list.iter().filter(|(e, _)| *e > now).count();
        let expected_fired = list.len() - expected_left;
        let mut rec = Recorder(Vec::new());
        assert_eq!(list.tick(now, &mut rec), expected_fired);
        assert_eq!(rec.0.len(), expected_fired);
        assert_eq!(list.len(), expected_left);
        assert!(list.iter().all(|(e, _)| e > now));
        assert_sorted(&list);
    }
}

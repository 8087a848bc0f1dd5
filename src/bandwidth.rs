//! Token-bucket bandwidth accounting.
//!
//! Rate limits are organized into peer classes: every connection belongs to
//! an ordered set of classes (the session's global class first, then its
//! torrent's), and a transfer must fit the quota of every class it belongs
//! to. A request that can't be granted at all is parked; the session tick
//! refills the buckets and drains the park list in arrival order.

use std::{collections::VecDeque, time::Duration};

pub(crate) type ClassId = usize;

/// The two directions are limited independently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Channel {
    Upload,
    Download,
}

#[derive(Clone, Debug)]
struct TokenBucket {
    /// Bytes currently available. Capped at one second's worth of rate so
    /// an idle bucket can't accumulate an unbounded burst.
    quota: u64,
    /// Bytes per second; zero means unlimited.
    rate_limit: u64,
}

impl TokenBucket {
    fn new(rate_limit: u64) -> Self {
        Self {
            quota: rate_limit,
            rate_limit,
        }
    }

    fn refill(&mut self, elapsed: Duration) {
        if self.rate_limit == 0 {
            return;
        }
        let earned =
            (self.rate_limit as f64 * elapsed.as_secs_f64()) as u64;
        self.quota = (self.quota + earned).min(self.rate_limit);
    }

    fn available(&self, want: u64) -> u64 {
        if self.rate_limit == 0 {
            want
        } else {
            want.min(self.quota)
        }
    }

    fn take(&mut self, n: u64) {
        if self.rate_limit > 0 {
            debug_assert!(self.quota >= n);
            self.quota -= n;
        }
    }
}

struct PeerClass {
    upload: TokenBucket,
    download: TokenBucket,
}

struct Parked {
    requester: usize,
    classes: Vec<ClassId>,
    channel: Channel,
    amount: u64,
}

pub(crate) struct BandwidthManager {
    classes: Vec<PeerClass>,
    parked: VecDeque<Parked>,
}

impl BandwidthManager {
    pub fn new() -> Self {
        Self {
            classes: Vec::new(),
            parked: VecDeque::new(),
        }
    }

    /// Creates a peer class with the given per-direction limits (zero for
    /// unlimited) and returns its id.
    pub fn add_class(&mut self, upload_limit: u64, download_limit: u64) -> ClassId {
        self.classes.push(PeerClass {
            upload: TokenBucket::new(upload_limit),
            download: TokenBucket::new(download_limit),
        });
        self.classes.len() - 1
    }

    pub fn set_limit(&mut self, class: ClassId, channel: Channel, rate: u64) {
        let bucket = self.bucket_mut(class, channel);
        let was_unlimited = bucket.rate_limit == 0;
        bucket.rate_limit = rate;
        // an unlimited bucket carried no quota; seed it with one second's
        // worth, otherwise keep what's left under the new cap
        if was_unlimited {
            bucket.quota = rate;
        } else {
            bucket.quota = bucket.quota.min(rate);
        }
    }

    /// Requests up to `amount` bytes of bandwidth across the given classes.
    /// The grant is the largest amount every class can cover; zero means the
    /// requester is parked and will be handed a grant from a later
    /// [`tick`](Self::tick).
    pub fn request(
        &mut self,
        requester: usize,
        classes: &[ClassId],
        channel: Channel,
        amount: u64,
    ) -> u64 {
        debug_assert!(amount > 0);
        let grant = self.grant(classes, channel, amount);
        if grant == 0 {
            self.parked.push_back(Parked {
                requester,
                classes: classes.to_vec(),
                channel,
                amount,
            });
        }
        grant
    }

    /// Refills all buckets for `elapsed` wall time and drains what can now
    /// be granted from the park list, in arrival order. Returns
    /// `(requester, granted)` pairs to resume.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<(usize, u64)> {
        for class in self.classes.iter_mut() {
            class.upload.refill(elapsed);
            class.download.refill(elapsed);
        }

        let mut resumed = Vec::new();
        let mut still_parked = VecDeque::new();
        while let Some(p) = self.parked.pop_front() {
            let grant = self.grant(&p.classes, p.channel, p.amount);
            if grant == 0 {
                still_parked.push_back(p);
            } else {
                resumed.push((p.requester, grant));
            }
        }
        self.parked = still_parked;
        resumed
    }

    pub fn num_parked(&self) -> usize {
        self.parked.len()
    }

    fn grant(&mut self, classes: &[ClassId], channel: Channel, amount: u64) -> u64 {
        let grant = classes.iter().fold(amount, |grant, &c| {
            self.bucket_mut(c, channel).available(grant)
        });
        if grant > 0 {
            for &c in classes {
                self.bucket_mut(c, channel).take(grant);
            }
        }
        grant
    }

    fn bucket_mut(&mut self, class: ClassId, channel: Channel) -> &mut TokenBucket {
        let class = &mut self.classes[class];
        match channel {
            Channel::Upload => &mut class.upload,
            Channel::Download => &mut class.download,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_class_grants_in_full() {
        let mut bw = BandwidthManager::new();
        let global = bw.add_class(0, 0);
        assert_eq!(bw.request(1, &[global], Channel::Upload, 50_000), 50_000);
        assert_eq!(bw.num_parked(), 0);
    }

    #[test]
    fn test_grant_is_min_across_classes() {
        let mut bw = BandwidthManager::new();
        let global = bw.add_class(10_000, 0);
        let torrent = bw.add_class(4_000, 0);
        let granted =
            bw.request(1, &[global, torrent], Channel::Upload, 8_000);
        assert_eq!(granted, 4_000);
        // the grant was charged against both classes
        assert_eq!(bw.request(2, &[global], Channel::Upload, 10_000), 6_000);
    }

    #[test]
    fn test_exhausted_bucket_parks_until_tick() {
        let mut bw = BandwidthManager::new();
        let global = bw.add_class(1_000, 0);
        assert_eq!(bw.request(1, &[global], Channel::Upload, 1_000), 1_000);
        // bucket drained: the next request parks
        assert_eq!(bw.request(2, &[global], Channel::Upload, 500), 0);
        assert_eq!(bw.num_parked(), 1);

        // half a second refills half the rate
        let resumed = bw.tick(Duration::from_millis(500));
        assert_eq!(resumed, vec![(2, 500)]);
        assert_eq!(bw.num_parked(), 0);
    }

    #[test]
    fn test_directions_are_independent() {
        let mut bw = BandwidthManager::new();
        let global = bw.add_class(1_000, 2_000);
        assert_eq!(bw.request(1, &[global], Channel::Upload, 1_000), 1_000);
        assert_eq!(bw.request(1, &[global], Channel::Download, 2_000), 2_000);
    }

    #[test]
    fn test_limit_change_applies_to_later_grants() {
        let mut bw = BandwidthManager::new();
        let global = bw.add_class(0, 0);
        assert_eq!(bw.request(1, &[global], Channel::Upload, 9_999), 9_999);

        bw.set_limit(global, Channel::Upload, 100);
        // quota was clamped down along with the limit
        assert_eq!(bw.request(1, &[global], Channel::Upload, 9_999), 100);
        assert_eq!(bw.request(1, &[global], Channel::Upload, 1), 0);
    }

    #[test]
    fn test_burst_is_capped_at_one_second() {
        let mut bw = BandwidthManager::new();
        let global = bw.add_class(1_000, 0);
        bw.tick(Duration::from_secs(60));
        // a minute of idling still only buys one second's burst
        assert_eq!(bw.request(1, &[global], Channel::Upload, 60_000), 1_000);
    }
}

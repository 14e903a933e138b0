use super::stripe::{StripeMap, StripeSet};

/// A worker's stripe assignment for one task run: the home stripe it drains
/// and the set of stripes it may steal from. The default policy lets every
/// worker steal from every stripe.
pub struct MarkAffinity {
    home: usize,
    stripe_map: StripeMap,
}

impl MarkAffinity {
    pub fn for_worker(stripes: &StripeSet, nworkers: u32, worker_id: u32) -> Self {
        MarkAffinity {
            home: stripes.stripe_for_worker(nworkers, worker_id).id(),
            stripe_map: StripeMap::all(stripes.nstripes()),
        }
    }

    pub fn home_stripe(&self) -> usize {
        self.home
    }

    pub fn stripe_map(&self) -> StripeMap {
        self.stripe_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_is_total_and_within_bounds() {
        let stripes = StripeSet::new();
        for &nstripes in &[1usize, 2, 4, 8, 16] {
            stripes.set_nstripes(nstripes);
            for nworkers in nstripes as u32..=(nstripes as u32 * 3) {
                for worker_id in 0..nworkers {
                    let affinity = MarkAffinity::for_worker(&stripes, nworkers, worker_id);
                    assert!(affinity.home_stripe() < nstripes);
                    assert_eq!(affinity.stripe_map(), StripeMap::all(nstripes));
                }
            }
        }
    }

    #[test]
    fn spillover_workers_spread_evenly() {
        let stripes = StripeSet::new();
        stripes.set_nstripes(4);
        // Seven workers on four stripes: four natural, three spillover.
        let homes: Vec<_> = (0..7)
            .map(|worker_id| MarkAffinity::for_worker(&stripes, 7, worker_id).home_stripe())
            .collect();
        assert_eq!(&homes[..4], &[0, 1, 2, 3]);
        // Spillover workers land at floor(slot * 4/3): stripes 0, 1, 2.
        assert_eq!(&homes[4..], &[0, 1, 2]);
    }
}

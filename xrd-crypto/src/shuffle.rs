//! Fisher-Yates shuffling of opaque byte records.

use rand::RngCore;

/// Shuffles records in place using a caller-supplied entropy source. The
/// permutation is regenerated whenever the input length changes and reused
/// otherwise, so repeated same-length batches avoid reallocation.
pub struct Shuffler<R> {
    perm: Vec<usize>,
    rng: R,
}

impl<R: RngCore> Shuffler<R> {
    pub fn new(rng: R) -> Self {
        Self {
            perm: Vec::new(),
            rng,
        }
    }

    pub fn shuffle(&mut self, records: &mut Vec<Vec<u8>>) {
        let n = records.len();
        if self.perm.len() != n {
            self.perm = self.permutation(n);
        }
        let mut orig: Vec<Option<Vec<u8>>> = records.drain(..).map(Some).collect();
        records.extend(
            self.perm
                .iter()
                .map(|&j| orig[j].take().expect("permutation is a bijection")),
        );
    }

    fn permutation(&mut self, n: usize) -> Vec<usize> {
        let mut perm: Vec<usize> = (0..n).collect();
        for i in (0..n).rev() {
            let j = self.rand_below(i + 1);
            perm.swap(i, j);
        }
        perm
    }

    fn rand_below(&mut self, bound: usize) -> usize {
        self.rng.next_u32() as usize % bound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rand::SeedableRng;

    fn records(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 4]).collect()
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut shuffler = Shuffler::new(OsRng);
        let mut recs = records(100);
        let orig = recs.clone();
        shuffler.shuffle(&mut recs);
        assert_eq!(recs.len(), orig.len());
        let mut sorted = recs.clone();
        sorted.sort();
        let mut orig_sorted = orig.clone();
        orig_sorted.sort();
        assert_eq!(sorted, orig_sorted);
    }

    #[test]
    fn permutation_reused_for_equal_lengths() {
        let rng = rand::rngs::StdRng::seed_from_u64(1);
        let mut shuffler = Shuffler::new(rng);
        let mut a = records(10);
        let mut b = records(10);
        shuffler.shuffle(&mut a);
        shuffler.shuffle(&mut b);
        assert_eq!(a, b);

        let mut c = records(5);
        shuffler.shuffle(&mut c);
        assert_eq!(c.len(), 5);
    }

    #[test]
    fn seeded_shuffles_differ_between_seeds() {
        let mut s1 = Shuffler::new(rand::rngs::StdRng::seed_from_u64(1));
        let mut s2 = Shuffler::new(rand::rngs::StdRng::seed_from_u64(2));
        let mut a = records(64);
        let mut b = records(64);
        s1.shuffle(&mut a);
        s2.shuffle(&mut b);
        assert_ne!(a, b);
    }
}

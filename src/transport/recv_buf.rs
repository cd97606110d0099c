/// Adaptive sizing for the registry's receive buffer: grow aggressively when a datagram fills
///  the buffer (it may well have been truncated), shrink only after repeated small reads so a
///  single small datagram does not thrash the size.
#[derive(Debug)]
pub struct RecvBufSizer {
    min: usize,
    max: usize,
    cur: usize,
    consecutive_small: u32,
}

impl RecvBufSizer {
    const SHRINK_AFTER: u32 = 2;

    pub fn new(min: usize, initial: usize, max: usize) -> RecvBufSizer {
        RecvBufSizer {
            min,
            max,
            cur: initial.clamp(min, max),
            consecutive_small: 0,
        }
    }

    pub fn next_size(&self) -> usize {
        self.cur
    }

    pub fn record(&mut self, bytes_read: usize) {
        if bytes_read >= self.cur {
            self.cur = (self.cur * 2).min(self.max);
            self.consecutive_small = 0;
        }
        else if bytes_read <= self.cur / 4 {
            self.consecutive_small += 1;
            if self.consecutive_small >= Self::SHRINK_AFTER {
                self.cur = (self.cur / 2).max(self.min);
                self.consecutive_small = 0;
            }
        }
        else {
            self.consecutive_small = 0;
        }
    }
}

impl Default for RecvBufSizer {
    fn default() -> Self {
        RecvBufSizer::new(512, 2048, 64 * 1024)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::full_read_grows(vec![2048], 4096)]
    #[case::grow_is_capped(vec![65536; 10], 65536)]
    #[case::one_small_read_keeps_size(vec![100], 2048)]
    #[case::two_small_reads_shrink(vec![100, 100], 1024)]
    #[case::medium_read_resets_small_streak(vec![100, 1000, 100], 2048)]
    #[case::shrink_is_floored(vec![1; 20], 512)]
    fn test_record(#[case] reads: Vec<usize>, #[case] expected: usize) {
        let mut sizer = RecvBufSizer::default();
        for bytes_read in reads {
            sizer.record(bytes_read);
        }
        assert_eq!(sizer.next_size(), expected);
    }

    #[rstest]
    fn test_initial_is_clamped() {
        assert_eq!(RecvBufSizer::new(1024, 100, 4096).next_size(), 1024);
        assert_eq!(RecvBufSizer::new(1024, 100_000, 4096).next_size(), 4096);
    }
}

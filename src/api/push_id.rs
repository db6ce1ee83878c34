//! Chronologically ordered push ids: 8 timestamp characters followed by 12
//! of entropy, incremented when two ids land in the same millisecond.

use rand::Rng;

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Per-database generator state; no process-wide singletons.
#[derive(Debug, Default)]
pub(crate) struct PushIdGenerator {
    last_push_time: u64,
    last_rand_chars: [u8; 12],
}

impl PushIdGenerator {
    pub fn next_push_id(&mut self, mut now: u64) -> String {
        let duplicate_time = now == self.last_push_time;
        self.last_push_time = now;

        let mut timestamp_chars = [0u8; 8];
        for slot in timestamp_chars.iter_mut().rev() {
            let index = (now % 64) as usize;
            now /= 64;
            *slot = PUSH_CHARS[index];
        }
        debug_assert!(now == 0, "push id timestamp overflowed base64 encoding");

        if !duplicate_time {
            let mut rng = rand::thread_rng();
            for slot in self.last_rand_chars.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        } else {
            let mut index = self.last_rand_chars.len();
            while index > 0 && self.last_rand_chars[index - 1] == 63 {
                self.last_rand_chars[index - 1] = 0;
                index -= 1;
            }
            if index == 0 {
                // Full rollover inside one millisecond; restart low so the
                // next tick reseeds.
                self.last_rand_chars[0] = 0;
            } else {
                self.last_rand_chars[index - 1] += 1;
            }
        }

        let mut id = String::with_capacity(20);
        for ch in &timestamp_chars {
            id.push(*ch as char);
        }
        for &rand_index in &self.last_rand_chars {
            id.push(PUSH_CHARS[rand_index as usize] as char);
        }
        debug_assert_eq!(id.len(), 20, "push id should be 20 characters");
        id
    }
}

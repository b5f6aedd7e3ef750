/// Number of descriptor slots; descriptor 0 is never handed out.
const SLOTS: usize = 1024;
const WORDS: usize = SLOTS / 64;

/// Allocator for container descriptors in `[1, 1024)`.
///
/// A cursor walks forward through the range, so a released descriptor is
/// only handed out again after every other free slot has been tried.
pub(crate) struct DescriptorPool {
    used: [u64; WORDS],
    cursor: usize,
    in_use: usize,
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self {
            used: [0; WORDS],
            cursor: 0,
            in_use: 0,
        }
    }
}

impl DescriptorPool {
    pub fn alloc(&mut self) -> i32 {
        if self.in_use >= SLOTS - 1 {
            log::error!("no free container descriptors");
            return -1;
        }

        loop {
            self.cursor = if self.cursor + 1 >= SLOTS {
                1
            } else {
                self.cursor + 1
            };
            if !self.is_used(self.cursor) {
                break;
            }
        }

        let cd = self.cursor;
        self.used[cd / 64] |= 1 << (cd % 64);
        self.in_use += 1;
        cd as i32
    }

    pub fn free(&mut self, cd: i32) -> bool {
        if cd < 1 || cd as usize >= SLOTS {
            log::error!("invalid container descriptor {cd}");
            return false;
        }

        let cd = cd as usize;
        if !self.is_used(cd) {
            log::error!("container descriptor {cd} is not allocated");
            return false;
        }

        self.used[cd / 64] &= !(1 << (cd % 64));
        self.in_use -= 1;
        true
    }

    fn is_used(&self, cd: usize) -> bool {
        self.used[cd / 64] & (1 << (cd % 64)) != 0
    }
}

/// Counted join for the bulk load: the arrival that brings the count to zero
/// is told it was last, so exactly one caller commits the completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBarrier {
    remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    Pending { remaining: usize },
    Last,
    /// The barrier had already completed.
    Spent,
}

impl LoadBarrier {
    pub fn new(expected: usize) -> Self {
        Self { remaining: expected }
    }

    pub fn arrive(&mut self) -> Arrival {
        match self.remaining {
            0 => Arrival::Spent,
            1 => {
                self.remaining = 0;
                Arrival::Last
            }
            n => {
                self.remaining = n - 1;
                Arrival::Pending {
                    remaining: self.remaining,
                }
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

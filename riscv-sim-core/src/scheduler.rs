//! Multi-hart scheduling.
//!
//! Two run modes: free-running round-robin (each hart gets one turn, optionally stopping as
//! soon as any hart halts) and a deterministic mode that draws a per-turn retire count from a
//! seeded PRNG so a run can be replayed bit-for-bit from the same seed. The PRNG is a small
//! splitmix64 implementation rather than a dependency, since the whole point of this mode is
//! that the sequence is fixed by the algorithm, not by whatever a general-purpose crate's
//! internals happen to do across versions.

/// Per-turn outcome a stepped hart reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The hart retired an instruction and is still runnable.
    Retired,
    /// The hart halted (e.g. reached a `--endpc` self-loop or a `tohost` write) and will not
    /// make further progress.
    Halted,
}

/// Anything the scheduler can advance by one instruction. Implemented by the board/hart wrapper;
/// kept as a trait so the scheduler doesn't need to know about `Core`/`Board`/`Allocator` generics.
pub trait Hart {
    fn step(&mut self) -> StepOutcome;
    fn is_halted(&self) -> bool;
}

/// splitmix64, used only to draw the deterministic-mode per-turn retire count. Not a
/// general-purpose RNG; it exists so `--deterministic --seed n` runs reproduce exactly.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Draws a value in `[lo, hi]` inclusive. Panics if `lo > hi`.
    pub fn next_range(&mut self, lo: u64, hi: u64) -> u64 {
        assert!(lo <= hi, "scheduler retire-count range is empty: {lo}..={hi}");
        let span = hi - lo + 1;
        lo + self.next_u64() % span
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RunMode {
    /// Round-robin over all harts, one instruction each per round.
    FreeRun { quit_on_any_hart: bool },
    /// Round-robin, but each hart retires a random number of instructions in `[lo, hi]` per
    /// turn, drawn from a seeded `SplitMix64`.
    Deterministic { seed: u64, lo: u64, hi: u64 },
}

pub struct Scheduler<H: Hart> {
    harts: Vec<H>,
    mode: RunMode,
    rng: Option<SplitMix64>,
}

impl<H: Hart> Scheduler<H> {
    pub fn new(harts: Vec<H>, mode: RunMode) -> Self {
        let rng = match mode {
            RunMode::Deterministic { seed, .. } => Some(SplitMix64::new(seed)),
            RunMode::FreeRun { .. } => None,
        };
        Self { harts, mode, rng }
    }

    pub fn harts(&self) -> &[H] {
        &self.harts
    }

    pub fn harts_mut(&mut self) -> &mut [H] {
        &mut self.harts
    }

    fn all_halted(&self) -> bool {
        self.harts.iter().all(|h| h.is_halted())
    }

    /// Runs one scheduling round across all non-halted harts. Returns `true` if the run should
    /// continue, `false` if it should stop (all harts halted, or `quit_on_any_hart` tripped).
    pub fn run_round(&mut self) -> bool {
        match self.mode {
            RunMode::FreeRun { quit_on_any_hart } => {
                for hart in self.harts.iter_mut() {
                    if hart.is_halted() {
                        continue;
                    }
                    if hart.step() == StepOutcome::Halted && quit_on_any_hart {
                        return false;
                    }
                }
            }
            RunMode::Deterministic { lo, hi, .. } => {
                let rng = self.rng.as_mut().expect("deterministic mode has an rng");
                for hart in self.harts.iter_mut() {
                    if hart.is_halted() {
                        continue;
                    }
                    let turn_count = rng.next_range(lo, hi);
                    for _ in 0..turn_count {
                        if hart.is_halted() {
                            break;
                        }
                        hart.step();
                    }
                }
            }
        }
        !self.all_halted()
    }

    /// Runs rounds until `run_round` says to stop or `max_rounds` is exhausted (to bound tests).
    pub fn run_until_halted(&mut self, max_rounds: Option<u64>) {
        let mut round = 0u64;
        loop {
            if let Some(max) = max_rounds {
                if round >= max {
                    break;
                }
            }
            if !self.run_round() {
                break;
            }
            round += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHart {
        steps: u64,
        halt_after: u64,
    }

    impl Hart for CountingHart {
        fn step(&mut self) -> StepOutcome {
            self.steps += 1;
            if self.steps >= self.halt_after {
                StepOutcome::Halted
            } else {
                StepOutcome::Retired
            }
        }

        fn is_halted(&self) -> bool {
            self.steps >= self.halt_after
        }
    }

    #[test]
    fn splitmix64_is_deterministic_for_a_given_seed() {
        let mut a = SplitMix64::new(42);
        let mut b = SplitMix64::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn next_range_stays_in_bounds() {
        let mut rng = SplitMix64::new(7);
        for _ in 0..1000 {
            let v = rng.next_range(3, 9);
            assert!((3..=9).contains(&v));
        }
    }

    #[test]
    fn free_run_quit_on_any_hart_stops_immediately() {
        let harts = vec![
            CountingHart { steps: 0, halt_after: 2 },
            CountingHart { steps: 0, halt_after: 100 },
        ];
        let mut sched = Scheduler::new(harts, RunMode::FreeRun { quit_on_any_hart: true });
        sched.run_until_halted(Some(10));
        assert_eq!(sched.harts()[0].steps, 2);
        assert!(sched.harts()[1].steps < 100);
    }

    #[test]
    fn free_run_without_quit_runs_all_harts_to_completion() {
        let harts = vec![
            CountingHart { steps: 0, halt_after: 3 },
            CountingHart { steps: 0, halt_after: 5 },
        ];
        let mut sched = Scheduler::new(harts, RunMode::FreeRun { quit_on_any_hart: false });
        sched.run_until_halted(Some(100));
        assert_eq!(sched.harts()[0].steps, 3);
        assert_eq!(sched.harts()[1].steps, 5);
    }

    #[test]
    fn deterministic_mode_reproduces_identical_step_counts_for_same_seed() {
        let run = |seed| {
            let harts = vec![
                CountingHart { steps: 0, halt_after: 50 },
                CountingHart { steps: 0, halt_after: 50 },
            ];
            let mut sched = Scheduler::new(harts, RunMode::Deterministic { seed, lo: 1, hi: 4 });
            sched.run_until_halted(Some(100));
            (sched.harts()[0].steps, sched.harts()[1].steps)
        };
        assert_eq!(run(99), run(99));
    }
}

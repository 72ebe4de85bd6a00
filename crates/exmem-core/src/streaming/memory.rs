//! Memory budget negotiation for streaming pipelines.
//!
//! Before any I/O, the driver collects every stage's memory request into a
//! [`MemoryPlan`], divides a total budget across them, and hands each stage
//! its grant. A stage that cannot run within its declared minimum is a
//! caller bug and panics up front rather than failing mid-run.

use std::fmt;

/// One stage's claim on the budget: a hard floor plus a weight for
/// dividing whatever is left over.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequest {
    /// Bytes the stage cannot run without.
    pub minimum: usize,
    /// Relative weight for surplus bytes; zero means "minimum only".
    pub priority: f64,
}

/// A stage that takes part in budget negotiation.
///
/// `memory_requests` appends the stage's own request first and then its
/// downstream stages' requests, recursively. `assign_memory` consumes
/// grants in the same order.
pub trait MemoryUser {
    /// Appends this stage's requests (own, then downstream) to the plan.
    fn memory_requests(&self, plan: &mut MemoryPlan);

    /// Takes this stage's grants (own, then downstream) out of `grants`.
    fn assign_memory(&mut self, grants: &mut Grants);
}

/// Ordered collection of [`MemoryRequest`]s for one pipeline.
#[derive(Debug, Default)]
pub struct MemoryPlan {
    requests: Vec<MemoryRequest>,
}

impl MemoryPlan {
    /// Gathers the full request list of `stage` and everything below it.
    pub fn collect(stage: &impl MemoryUser) -> Self {
        let mut plan = Self::default();
        stage.memory_requests(&mut plan);
        plan
    }

    /// Appends one request.
    pub fn request(&mut self, minimum: usize, priority: f64) {
        assert!(
            priority >= 0.0 && priority.is_finite(),
            "memory priority must be a finite non-negative weight, got {priority}"
        );
        self.requests.push(MemoryRequest { minimum, priority });
    }

    /// Sum of all hard minimums.
    #[must_use]
    pub fn total_minimum(&self) -> usize {
        self.requests.iter().map(|r| r.minimum).sum()
    }

    /// Divides `total` bytes across the requests.
    ///
    /// Every request gets its minimum; the surplus is split proportionally
    /// to priorities, rounding by largest remainder with the earliest
    /// request winning ties.
    ///
    /// # Panics
    ///
    /// Panics when `total` does not cover the sum of minimums.
    #[must_use]
    pub fn divide(&self, total: usize) -> Grants {
        let floor = self.total_minimum();
        assert!(
            total >= floor,
            "memory budget of {total} bytes is below the {floor}-byte minimum"
        );
        let surplus = total - floor;
        let weight: f64 = self.requests.iter().map(|r| r.priority).sum();

        let mut grants: Vec<usize> = self.requests.iter().map(|r| r.minimum).collect();
        if surplus > 0 && weight > 0.0 {
            let mut assigned = 0;
            let mut remainders: Vec<(usize, f64)> = Vec::with_capacity(self.requests.len());
            for (i, request) in self.requests.iter().enumerate() {
                let exact = surplus as f64 * request.priority / weight;
                let share = exact as usize;
                grants[i] += share;
                assigned += share;
                remainders.push((i, exact - share as f64));
            }
            // Leftover bytes from truncation go to the largest remainders,
            // earliest request first on ties.
            remainders.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
            for &(i, _) in remainders.iter().take(surplus - assigned) {
                grants[i] += 1;
            }
        }
        Grants::new(grants)
    }
}

/// The per-request byte grants produced by [`MemoryPlan::divide`], consumed
/// in request order.
pub struct Grants {
    grants: std::vec::IntoIter<usize>,
    total: usize,
}

impl Grants {
    fn new(grants: Vec<usize>) -> Self {
        let total = grants.len();
        Self {
            grants: grants.into_iter(),
            total,
        }
    }

    /// Takes the next grant.
    ///
    /// # Panics
    ///
    /// Panics when a stage takes more grants than it requested.
    pub fn take(&mut self) -> usize {
        self.grants
            .next()
            .unwrap_or_else(|| panic!("stage took more than its {} memory grants", self.total))
    }

    /// Number of grants not yet taken.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.grants.len()
    }
}

impl fmt::Debug for Grants {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grants")
            .field("remaining", &self.grants.len())
            .finish()
    }
}

/// Runs one full negotiation round: collect requests, divide `total`, and
/// assign every grant.
///
/// # Panics
///
/// Panics when `total` is below the pipeline's summed minimums, or when the
/// stage's request and assignment orders disagree.
pub fn divide_memory(stage: &mut impl MemoryUser, total: usize) {
    let plan = MemoryPlan::collect(stage);
    let mut grants = plan.divide(total);
    stage.assign_memory(&mut grants);
    assert!(
        grants.remaining() == 0,
        "{} memory grants were never assigned",
        grants.remaining()
    );
}

/// A stage's single memory account.
///
/// Embedded by stages with one budget; stages that buffer on input and
/// write on output keep a [`MemorySplit`] instead.
#[derive(Debug, Clone)]
pub struct MemorySingle {
    minimum: usize,
    assigned: usize,
    priority: f64,
}

impl MemorySingle {
    /// Creates an account with the default priority of 1.
    #[must_use]
    pub fn new(minimum: usize) -> Self {
        Self::with_priority(minimum, 1.0)
    }

    /// Creates an account with an explicit surplus weight.
    #[must_use]
    pub fn with_priority(minimum: usize, priority: f64) -> Self {
        Self {
            minimum,
            assigned: minimum,
            priority,
        }
    }

    /// The hard floor declared at construction.
    #[must_use]
    pub fn minimum_memory(&self) -> usize {
        self.minimum
    }

    /// The currently assigned budget; starts at the minimum.
    #[must_use]
    pub fn memory(&self) -> usize {
        self.assigned
    }

    /// Surplus weight.
    #[must_use]
    pub fn memory_priority(&self) -> f64 {
        self.priority
    }

    /// Assigns a budget.
    ///
    /// # Panics
    ///
    /// Panics below the declared minimum.
    pub fn set_memory(&mut self, bytes: usize) {
        assert!(
            bytes >= self.minimum,
            "assigned {bytes} bytes, below the declared minimum of {}",
            self.minimum
        );
        self.assigned = bytes;
    }

    /// Raises the declared minimum (and the assignment, if it now falls
    /// short).
    pub fn raise_minimum(&mut self, minimum: usize) {
        self.minimum = self.minimum.max(minimum);
        self.assigned = self.assigned.max(self.minimum);
    }

    /// Appends this account's request to a plan.
    pub fn request(&self, plan: &mut MemoryPlan) {
        plan.request(self.minimum, self.priority);
    }

    /// Takes this account's grant.
    pub fn assign(&mut self, grants: &mut Grants) {
        self.set_memory(grants.take());
    }
}

/// Separate input and output memory accounts.
///
/// Sorters hold one of these: the input side pays for the run-formation
/// buffer, the output side for merge fan-in.
#[derive(Debug, Clone)]
pub struct MemorySplit {
    /// Budget for the input (push/buffering) phase.
    pub input: MemorySingle,
    /// Budget for the output (merge/replay) phase.
    pub output: MemorySingle,
}

impl MemorySplit {
    /// Creates both accounts with the default priority of 1.
    #[must_use]
    pub fn new(minimum_in: usize, minimum_out: usize) -> Self {
        Self {
            input: MemorySingle::new(minimum_in),
            output: MemorySingle::new(minimum_out),
        }
    }

    /// Appends both requests, input first.
    pub fn request(&self, plan: &mut MemoryPlan) {
        self.input.request(plan);
        self.output.request(plan);
    }

    /// Takes both grants, input first.
    pub fn assign(&mut self, grants: &mut Grants) {
        self.input.assign(grants);
        self.output.assign(grants);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimums_always_covered() {
        let mut plan = MemoryPlan::default();
        plan.request(100, 1.0);
        plan.request(50, 0.0);
        let mut grants = plan.divide(150);
        assert_eq!(grants.take(), 100);
        assert_eq!(grants.take(), 50);
    }

    #[test]
    fn test_surplus_follows_priority() {
        let mut plan = MemoryPlan::default();
        plan.request(0, 3.0);
        plan.request(0, 1.0);
        let mut grants = plan.divide(400);
        assert_eq!(grants.take(), 300);
        assert_eq!(grants.take(), 100);
    }

    #[test]
    fn test_zero_priority_gets_only_minimum() {
        let mut plan = MemoryPlan::default();
        plan.request(10, 0.0);
        plan.request(10, 2.0);
        let mut grants = plan.divide(1000);
        assert_eq!(grants.take(), 10);
        assert_eq!(grants.take(), 990);
    }

    #[test]
    fn test_largest_remainder_rounding_spends_every_byte() {
        let mut plan = MemoryPlan::default();
        plan.request(0, 1.0);
        plan.request(0, 1.0);
        plan.request(0, 1.0);
        let mut grants = plan.divide(100);
        let g = [grants.take(), grants.take(), grants.take()];
        assert_eq!(g.iter().sum::<usize>(), 100);
        // equal weights and remainders: earliest request wins the spare byte
        assert_eq!(g, [34, 33, 33]);
    }

    #[test]
    #[should_panic(expected = "below the")]
    fn test_budget_under_minimum_panics() {
        let mut plan = MemoryPlan::default();
        plan.request(100, 1.0);
        let _ = plan.divide(99);
    }

    #[test]
    #[should_panic(expected = "below the declared minimum")]
    fn test_set_memory_under_minimum_panics() {
        let mut account = MemorySingle::new(64);
        account.set_memory(63);
    }
}

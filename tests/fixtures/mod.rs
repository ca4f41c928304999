//! Batch fixtures shared by the in-process and end-to-end tests.
//!
//! Availability assumes the mock checker's default rule: an item exists
//! when its id is divisible by 7.

/// A submission and the terminal status it must reach.
#[derive(Debug, Clone)]
pub struct BatchFixture {
    pub name: &'static str,
    pub item_ids: &'static [u64],
    pub expected_status: &'static str,
    pub success_count: u32,
    pub failed_count: u32,
}

pub const BATCH_FIXTURES: &[BatchFixture] = &[
    BatchFixture {
        name: "all available",
        item_ids: &[70000, 70007, 70014],
        expected_status: "completed",
        success_count: 3,
        failed_count: 0,
    },
    BatchFixture {
        name: "single unavailable",
        item_ids: &[70001],
        expected_status: "failed",
        success_count: 0,
        failed_count: 1,
    },
    BatchFixture {
        name: "mixed batch",
        item_ids: &[14, 15, 21, 22, 28],
        expected_status: "completed",
        success_count: 3,
        failed_count: 2,
    },
    BatchFixture {
        name: "all unavailable",
        item_ids: &[1, 2, 3, 4, 5, 6],
        expected_status: "failed",
        success_count: 0,
        failed_count: 6,
    },
];

//! Internal testing utilities for the parten crates.

use std::fmt::Debug;
use std::panic::{RefUnwindSafe, UnwindSafe};

/// Trait for running parametrized (aka. table-driven) tests.
///
/// To create a table-driven test:
///
/// 1. Import the `TestCases` trait.
/// 2. Define a struct, conventionally named `Case`, holding the data for one
///    test case. It must implement `Debug`.
/// 3. Build a collection of cases (an array or Vec), conventionally named
///    `cases`.
/// 4. Call `cases.test_each` with the test function.
///
/// Every case is run even if an earlier one panics. If any case panicked,
/// the run ends with a panic that lists the failing cases by their debug
/// representation.
///
/// ## Example
///
/// ```
/// use parten_testing::TestCases;
///
/// // Add #[test] attribute
/// fn test_resolve_axis() {
///   #[derive(Debug)]
///   struct Case {
///     rank: usize,
///     axis: i32,
///     expected: usize,
///   }
///
///   let cases = [
///     Case { rank: 4, axis: -1, expected: 3 },
///     Case { rank: 4, axis: 2, expected: 2 },
///   ];
///
///   cases.test_each(|&Case { rank, axis, expected }| {
///     let resolved = if axis < 0 { axis + rank as i32 } else { axis } as usize;
///     assert_eq!(resolved, expected);
///   });
/// }
/// # test_resolve_axis();
/// ```
///
/// ## Unwind safety
///
/// Cases and the test function must be [unwind
/// safe](https://doc.rust-lang.org/std/panic/fn.catch_unwind.html). In
/// practice this means neither may contain interior mutability. Fields that
/// are not unwind safe can be replaced by a description of how to build the
/// value inside the test function, or wrapped in
/// [`AssertUnwindSafe`](std::panic::AssertUnwindSafe).
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Run `test` against each case in `self` by reference, catching panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;

    /// Variant of [`test_each`](TestCases::test_each) which passes cases by
    /// value.
    ///
    /// Each case is formatted to a string up front so its debug
    /// representation is still available if the test panics. This adds a
    /// little overhead per case.
    fn test_each_value(self, test: impl Fn(Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe;
}

fn report_failures(failures: Vec<String>) {
    if failures.is_empty() {
        return;
    }
    let mut message = format!("{} test cases failed:", failures.len());
    for failure in failures {
        message.push_str("\n  ");
        message.push_str(&failure);
    }
    panic!("{}", message);
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            if std::panic::catch_unwind(|| test(&case)).is_err() {
                failures.push(format!("{:?}", case));
            }
        }
        report_failures(failures);
    }

    fn test_each_value(self, test: impl Fn(I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + UnwindSafe,
    {
        let mut failures = Vec::new();
        for case in self {
            let test = &test;
            let case_str = format!("{:?}", case);
            if std::panic::catch_unwind(move || test(case)).is_err() {
                failures.push(case_str);
            }
        }
        report_failures(failures);
    }
}

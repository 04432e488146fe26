// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named statistics.
//!
//! The shape follows illumos named kstats (`kstat_create(9F)`): a
//! struct of `u64` counters, registered once under a module and name.
//! Outside the kernel there is nothing to register with, so the
//! counters are simply allocated and read back through snapshots.
use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;

/// The longest name a kstat may carry, including the NUL.
pub const KSTAT_STRLEN: usize = 31;

/// A provider of named kstats.
///
/// Rather than implementing this trait manually, the kstat-macro
/// should be used.
///
/// # Example
///
/// To declare a new kstat provider simply define a struct of named
/// fields with type [`KStatU64`] and derive [`KStatProvider`].
///
/// ```ignore
/// #[derive(KStatProvider)]
/// struct SweepStats {
///     runs: KStatU64,
///     resched: KStatU64,
/// }
/// ```
///
/// To update the values use the `+=` operator.
///
/// ```ignore
/// stats.vals.runs += 1;
/// ```
pub trait KStatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn init(&mut self) -> Result<(), Error>;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;
}

/// Initialize and register a [`KStatProvider`].
///
/// This should be called **exactly** once for a given provider.
pub struct KStatNamed<T: KStatProvider> {
    pub vals: Box<T>,
}

impl<T: KStatProvider> KStatNamed<T> {
    pub fn new(
        module: &str,
        name: &str,
        provider: T,
    ) -> Result<KStatNamed<T>, Error> {
        for s in [module, name] {
            if s.contains('\0') {
                return Err(Error::NulChar);
            }
            if s.len() + 1 > KSTAT_STRLEN {
                return Err(Error::NameTooLong(s.into()));
            }
        }

        let mut vals = Box::new(provider);
        vals.init()?;
        Ok(Self { vals })
    }
}

/// A 64-bit unsigned named kstat.
#[derive(Debug, Default)]
pub struct KStatU64 {
    value: u64,
}

impl KStatU64 {
    pub fn init(&mut self, name: &str) -> Result<(), Error> {
        // The kernel would silently truncate, but we opt to alert the
        // consumer instead.
        if name.len() + 1 > KSTAT_STRLEN {
            return Err(Error::NameTooLong(name.into()));
        }
        Ok(())
    }

    pub fn new() -> Self {
        Self { value: 0 }
    }

    pub fn set(&mut self, val: u64) {
        self.value = val;
    }

    pub fn val(&self) -> u64 {
        self.value
    }
}

impl core::ops::AddAssign<u64> for KStatU64 {
    fn add_assign(&mut self, other: u64) {
        self.value = self.value.wrapping_add(other);
    }
}

impl core::ops::SubAssign<u64> for KStatU64 {
    fn sub_assign(&mut self, other: u64) {
        self.value = self.value.wrapping_sub(other);
    }
}

/// A kstat error.
#[derive(Clone, Debug)]
pub enum Error {
    NameTooLong(String),
    NulChar,
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NameTooLong(name) => {
                write!(f, "kstat name too long: {}", name)
            }

            Self::NulChar => write!(f, "kstat name contains NUL char"),
        }
    }
}

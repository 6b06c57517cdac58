// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusive access to shared hardware resources.
//!
//! A single process-wide bitmap tracks which fixed hardware resources are
//! spoken for. The intended discipline is scoped: a driver obtains its
//! resource at construction (so two drivers fighting over the same timer
//! fail loudly, at init time) and releases it at destruction --
//! [`Claim`] packages exactly that.

use crate::arch;

/// The hardware resources under management.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceId {
    Timer0 = 0,
    Timer1,
    Timer2,
    UsartRx0,
    UsartRx1,
    UsartRx2,
    UsartRx3,
    UsartTx0,
    UsartTx1,
    UsartTx2,
    UsartTx3,
    Spi,
    Adc,
    I2c,
}

/// Obtains exclusive access to a resource. `false` means it is already
/// held.
pub fn obtain(id: ResourceId) -> bool {
    arch::with_kernel(|k| k.obtain_resource(id))
}

/// Releases a previously held resource back to the system.
pub fn release(id: ResourceId) {
    arch::with_kernel(|k| k.release_resource(id));
}

/// A held resource that releases itself when dropped.
#[derive(Debug)]
pub struct Claim {
    id: ResourceId,
}

impl Claim {
    /// Tries to take `id`, returning the claim on success.
    pub fn obtain(id: ResourceId) -> Option<Self> {
        obtain(id).then_some(Self { id })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::kernel::Kernel;

    fn install() {
        let k = Box::leak(Box::new(Kernel::new(
            vec![0u8; 4 * config::PAGE_BYTES].leak(),
        )));
        arch::install_kernel(k);
    }

    #[test]
    fn claim_is_exclusive_and_scoped() {
        install();

        let c = Claim::obtain(ResourceId::Spi).unwrap();
        assert_eq!(c.id(), ResourceId::Spi);
        assert!(Claim::obtain(ResourceId::Spi).is_none());
        // A different resource is unaffected.
        assert!(obtain(ResourceId::Adc));

        drop(c);
        let again = Claim::obtain(ResourceId::Spi);
        assert!(again.is_some());
    }
}

/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::{fmt, str::FromStr};

/// Declares a dimension enum whose variants render as the tags used in campaign files.
/// `ALL` lists the variants in sweep order.
macro_rules! dimension {
    ($name:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($name::$variant),)+
                    other => Err(format!(
                        "`{other}` is not a valid {} (expected one of {:?})",
                        stringify!($name),
                        [$($tag),+]
                    )),
                }
            }
        }
    };
}

dimension!(VmCount {
    Thirteen => "13VM",
    Four => "4VM",
});

dimension!(VirtMethod {
    Pv => "pv",
    Hvm => "hvm",
    Pvh => "pvh",
});

dimension!(VcpuPinning {
    PinningOn => "pinning-on",
    PinningOff => "pinning-off",
    NullPinning => "null-pinning",
});

dimension!(Taskset {
    On => "taskset-on",
    Off => "taskset-off",
});

dimension!(Scheduler {
    Credit2Ms1 => "credit2-1ms",
    Credit2Ms3 => "credit2-3ms",
    Credit2Ms10 => "credit2-10ms",
    Null => "null",
});

dimension!(Hyperthreading {
    On => "ht-on",
    Off => "ht-off",
});

dimension!(MemManagement {
    Hap => "hap",
    Shadow => "shadow",
    PvMmu => "pv-mmu",
});

dimension!(Dom0Cpus {
    AllCpus => "dom0-all-cpus",
    LessCpus => "dom0-less-cpus",
    LessCpusPinned => "dom0-less-cpus-pinned",
    NullPinning => "dom0-null-pinning",
});

dimension!(Slop {
    Default => "default-slop",
    Low => "low-slop",
});

impl VmCount {
    /// Number of guests the class is sized for on a fully available host.
    pub fn guests(&self) -> u32 {
        match self {
            VmCount::Thirteen => 13,
            VmCount::Four => 4,
        }
    }
}

impl Scheduler {
    /// Credit2 rate limit in microseconds, `None` for the null scheduler.
    pub fn ratelimit_us(&self) -> Option<u32> {
        match self {
            Scheduler::Credit2Ms1 => Some(1_000),
            Scheduler::Credit2Ms3 => Some(3_000),
            Scheduler::Credit2Ms10 => Some(10_000),
            Scheduler::Null => None,
        }
    }
}

impl Dom0Cpus {
    /// Whether dom0 is confined to a reserved block of CPUs that guests must not use.
    pub fn reserves_cpus(&self) -> bool {
        matches!(self, Dom0Cpus::LessCpusPinned | Dom0Cpus::NullPinning)
    }
}

/// A single value of any dimension, used to express couplings between dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionValue {
    VmCount(VmCount),
    VirtMethod(VirtMethod),
    VcpuPinning(VcpuPinning),
    Taskset(Taskset),
    Scheduler(Scheduler),
    Hyperthreading(Hyperthreading),
    MemManagement(MemManagement),
    Dom0Cpus(Dom0Cpus),
    Slop(Slop),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_for_every_variant() {
        for sched in Scheduler::ALL {
            assert_eq!(sched.as_str().parse::<Scheduler>(), Ok(*sched));
        }
        for dom0 in Dom0Cpus::ALL {
            assert_eq!(dom0.to_string().parse::<Dom0Cpus>(), Ok(*dom0));
        }
    }

    #[test]
    fn unknown_tag_names_the_dimension() {
        let err = "credit3".parse::<Scheduler>().unwrap_err();
        assert!(err.contains("Scheduler"));
        assert!(err.contains("credit3"));
    }

    #[test]
    fn only_pinned_dom0_modes_reserve_cpus() {
        assert!(Dom0Cpus::LessCpusPinned.reserves_cpus());
        assert!(Dom0Cpus::NullPinning.reserves_cpus());
        assert!(!Dom0Cpus::LessCpus.reserves_cpus());
        assert!(!Dom0Cpus::AllCpus.reserves_cpus());
    }
}

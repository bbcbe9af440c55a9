// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Vendor groups and their tunables.
//!
//! Every task belongs to one vendor group, derived from the name of the
//! cgroup it runs in. The per-group properties are published as an immutable
//! snapshot: readers clone an `Arc` and never lock while deciding, and an
//! administrative update swaps in a new snapshot, guarded by the version token
//! of the snapshot it was derived from.

use crate::types::UclampId;
use crate::types::UCLAMP_CNT;
use crate::types::SCHED_CAPACITY_SCALE;
use anyhow::bail;
use anyhow::Result;
use log::info;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VendorGroup {
    System,
    TopApp,
    Foreground,
    Camera,
    Background,
    SystemBackground,
    NnapiHal,
    Rt,
    Dex2oat,
}

pub const VG_MAX: usize = 9;

impl VendorGroup {
    pub const ALL: [VendorGroup; VG_MAX] = [
        VendorGroup::System,
        VendorGroup::TopApp,
        VendorGroup::Foreground,
        VendorGroup::Camera,
        VendorGroup::Background,
        VendorGroup::SystemBackground,
        VendorGroup::NnapiHal,
        VendorGroup::Rt,
        VendorGroup::Dex2oat,
    ];

    /// Classify a cgroup by its directory name. Unknown names land in
    /// `System`.
    pub fn from_cgroup_name(name: &str) -> VendorGroup {
        match name {
            "system" => VendorGroup::System,
            "top-app" => VendorGroup::TopApp,
            "foreground" | "audio-app" => VendorGroup::Foreground,
            "camera-daemon" => VendorGroup::Camera,
            "background" => VendorGroup::Background,
            "system-background" => VendorGroup::SystemBackground,
            "nnapi-hal" => VendorGroup::NnapiHal,
            "rt" => VendorGroup::Rt,
            "dex2oat" => VendorGroup::Dex2oat,
            _ => VendorGroup::System,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            VendorGroup::System => "system",
            VendorGroup::TopApp => "top-app",
            VendorGroup::Foreground => "foreground",
            VendorGroup::Camera => "camera",
            VendorGroup::Background => "background",
            VendorGroup::SystemBackground => "system-background",
            VendorGroup::NnapiHal => "nnapi-hal",
            VendorGroup::Rt => "rt",
            VendorGroup::Dex2oat => "dex2oat",
        }
    }
}

impl fmt::Display for VendorGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A clamp request: the value and whether it was explicitly asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UclampRequest {
    pub value: u32,
    #[serde(default)]
    pub user_defined: bool,
}

impl UclampRequest {
    pub fn none(clamp_id: UclampId) -> UclampRequest {
        UclampRequest {
            value: clamp_id.none(),
            user_defined: false,
        }
    }

    pub fn user(value: u32) -> UclampRequest {
        UclampRequest {
            value: value.min(SCHED_CAPACITY_SCALE as u32),
            user_defined: true,
        }
    }
}

fn default_uclamp_req() -> [UclampRequest; UCLAMP_CNT] {
    [
        UclampRequest::none(UclampId::Min),
        UclampRequest::none(UclampId::Max),
    ]
}

fn default_group_throttle() -> u32 {
    SCHED_CAPACITY_SCALE as u32
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorGroupProperty {
    #[serde(default)]
    pub prefer_idle: bool,
    #[serde(default)]
    pub prefer_high_cap: bool,
    #[serde(default)]
    pub task_spreading: bool,
    /// Per-CPU utilization cap of the group, on the capacity scale.
    #[serde(default = "default_group_throttle")]
    pub group_throttle: u32,
    #[serde(default = "default_uclamp_req")]
    pub uclamp_req: [UclampRequest; UCLAMP_CNT],
}

impl Default for VendorGroupProperty {
    fn default() -> Self {
        Self {
            prefer_idle: false,
            prefer_high_cap: false,
            task_spreading: false,
            group_throttle: default_group_throttle(),
            uclamp_req: default_uclamp_req(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VendorGroupSnapshot {
    pub version: u64,
    props: Vec<VendorGroupProperty>,
}

impl VendorGroupSnapshot {
    pub fn get(&self, group: VendorGroup) -> &VendorGroupProperty {
        &self.props[group.index()]
    }
}

impl Default for VendorGroupSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            props: vec![VendorGroupProperty::default(); VG_MAX],
        }
    }
}

#[derive(Debug, Default)]
pub struct VendorGroupTable {
    current: RwLock<Arc<VendorGroupSnapshot>>,
}

impl VendorGroupTable {
    /// Build the table with the given overrides on top of the defaults.
    pub fn new(overrides: &BTreeMap<VendorGroup, VendorGroupProperty>) -> VendorGroupTable {
        let mut snap = VendorGroupSnapshot::default();
        for (group, prop) in overrides.iter() {
            snap.props[group.index()] = prop.clone();
        }
        VendorGroupTable {
            current: RwLock::new(Arc::new(snap)),
        }
    }

    pub fn snapshot(&self) -> Arc<VendorGroupSnapshot> {
        let guard = match self.current.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clone()
    }

    /// Publish a new property for `group`. `expected_version` must be the
    /// version of the snapshot the update was computed from.
    pub fn replace(
        &self,
        expected_version: u64,
        group: VendorGroup,
        prop: VendorGroupProperty,
    ) -> Result<u64> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.version != expected_version {
            bail!(
                "Stale vendor group update for {} (version {}, current {})",
                group,
                expected_version,
                guard.version
            );
        }
        if prop.group_throttle > SCHED_CAPACITY_SCALE as u32 {
            bail!("Invalid group throttle {} for {}", prop.group_throttle, group);
        }

        let mut next = (**guard).clone();
        next.version += 1;
        next.props[group.index()] = prop;
        let version = next.version;
        *guard = Arc::new(next);
        info!("vendor group {} updated, version {}", group, version);
        Ok(version)
    }
}

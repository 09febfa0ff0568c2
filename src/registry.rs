// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).
//
// The Local Registry (§4.2): a concurrent device-id -> Session Ref mapping. Adapted from the
// upstream engine workspace's `graph` crate, which serializes mutation of its node table
// behind a single lock (`graph::InnerGraph`); here each device id gets its own shard lock via
// `dashmap`, because spec.md §5 requires two concurrent `compute` calls for *different*
// device ids to not serialize on one lock -- a guarantee the teacher's single-lock table
// does not need to provide for its much rarer node insertions.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;

use crate::core::ManagerCore;
use crate::device_id::DeviceId;
use crate::session_ref::{BoxProducer, Computer, SessionRef};

#[derive(Default)]
pub(crate) struct Registry {
    map: DashMap<DeviceId, Arc<SessionRef>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &DeviceId) -> Option<Arc<SessionRef>> {
        self.map.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn contains(&self, id: &DeviceId) -> bool {
        self.map.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<(DeviceId, Arc<SessionRef>)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Compare-and-remove by Ref identity: removes the entry only if it still points at
    /// `expected`, so a Ref that has already been superseded (R1) cannot evict its
    /// replacement's entry.
    pub(crate) fn remove_if_matches(&self, id: &DeviceId, expected: &Arc<SessionRef>) -> bool {
        self.map
            .remove_if(id, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
    }

    /// `compute(deviceId, creator?, updater?) -> session-or-empty` (§4.2).
    pub(crate) async fn compute_if(
        &self,
        core: &Weak<ManagerCore>,
        id: DeviceId,
        creator: Option<BoxProducer>,
        updater: Option<Computer>,
    ) -> Option<Arc<SessionRef>> {
        enum Action {
            Fresh(Arc<SessionRef>),
            UpdateExisting(Arc<SessionRef>, Computer),
            Existing(Arc<SessionRef>),
            Untouched,
        }

        let action = match self.map.entry(id.clone()) {
            DashEntry::Vacant(vacant) => match creator {
                Some(creator) => {
                    let r = SessionRef::new(id, core.clone(), creator);
                    vacant.insert(r.clone());
                    Action::Fresh(r)
                }
                None => Action::Untouched,
            },
            DashEntry::Occupied(occupied) => {
                let r = occupied.get().clone();
                match updater {
                    Some(updater) => Action::UpdateExisting(r, updater),
                    None => Action::Existing(r),
                }
            }
        };

        match action {
            Action::Fresh(r) | Action::Existing(r) => Some(r),
            Action::UpdateExisting(r, updater) => {
                // "prior.update(s => s.flatMap(updater))": only run the updater when there is
                // a current session to flat-map over; otherwise leave the pending load as-is.
                let mapper: Computer = Box::new(move |current| match current {
                    Some(cur) => updater(Some(cur)),
                    None => Box::pin(async { Ok(None) }),
                });
                r.update(mapper).await;
                Some(r)
            }
            Action::Untouched => None,
        }
    }

    /// `compute(deviceId, computer) -> session` (§4.2): unconditional upsert.
    pub(crate) async fn compute(
        &self,
        core: &Weak<ManagerCore>,
        id: DeviceId,
        computer: Computer,
    ) -> Arc<SessionRef> {
        enum Action {
            Fresh(Arc<SessionRef>),
            UpdateExisting(Arc<SessionRef>, Computer),
        }

        let action = match self.map.entry(id.clone()) {
            DashEntry::Vacant(vacant) => {
                let producer: BoxProducer = Box::new(move || computer(None));
                let r = SessionRef::new(id, core.clone(), producer);
                vacant.insert(r.clone());
                Action::Fresh(r)
            }
            DashEntry::Occupied(occupied) => Action::UpdateExisting(occupied.get().clone(), computer),
        };

        match action {
            Action::Fresh(r) => r,
            Action::UpdateExisting(r, computer) => {
                r.update(computer).await;
                r
            }
        }
    }
}

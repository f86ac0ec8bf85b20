//! Communicator creation from existing communicators and groups.

use std::sync::Arc;

use crate::comm::{Comm, CommBuilder, CommKind};
use crate::context_id::ContextId;
use crate::error::{Error, Result};
use crate::group::{Group, Lpid};
use crate::hierarchy::HierarchyKind;
use crate::info::Info;
use crate::map::{MapDir, Mapping};

impl Comm {
    /// Duplicate the communicator: same group(s), same hints, new context.
    ///
    /// `info` is applied on top of the copied hints. Collective.
    pub fn dup(self: &Arc<Self>, info: Option<&Info>) -> Result<Arc<Comm>> {
        self.ensure_usable()?;
        let shared = self.shared()?;

        let mut builder = match self.kind() {
            CommKind::Intra => {
                let lease = shared.context_ids.allocate(shared.device.as_ref(), &self.scope())?;
                CommBuilder::new(&shared)?.context(lease)
            }
            CommKind::Inter => {
                let local = self.local_comm()?;
                let lease =
                    shared.context_ids.allocate(shared.device.as_ref(), &local.scope())?;
                let remote = shared
                    .device
                    .allgather(&self.scope(), &[i64::from(lease.id().raw())])?;
                let send = remote_context(&remote)?;
                CommBuilder::new(&shared)?
                    .kind(CommKind::Inter)
                    .inter_context(send, lease)
                    .low_group(self.is_low_group())
            }
        };
        builder = builder.inherit_from(self).copy_hints(self).info(info);
        builder.map_dup(self, MapDir::L2L);
        if self.is_intercomm() {
            builder.map_dup(self, MapDir::R2R);
        }
        builder.commit()
    }

    /// Create a communicator from a subgroup of this one.
    ///
    /// Dispatches to [`create_intra`](Self::create_intra) or
    /// [`create_inter`](Self::create_inter). Collective.
    pub fn create(self: &Arc<Self>, group: &Group) -> Result<Option<Arc<Comm>>> {
        match self.kind() {
            CommKind::Intra => self.create_intra(group),
            CommKind::Inter => self.create_inter(group),
        }
    }

    /// Create an intracommunicator holding the members of `group`, in group
    /// order. Processes outside `group` get `None`. Collective.
    pub fn create_intra(self: &Arc<Self>, group: &Group) -> Result<Option<Arc<Comm>>> {
        self.ensure_usable()?;
        if self.is_intercomm() {
            return Err(Error::InvalidCommunicator);
        }
        let shared = self.shared()?;
        let mapping = group_to_ranks(self.local_group(), group)?;

        let lease = shared.context_ids.allocate(shared.device.as_ref(), &self.scope())?;
        if group.rank_of(shared.my_lpid).is_none() {
            return Ok(None);
        }

        let size = mapping.len();
        let mut builder = CommBuilder::new(&shared)?
            .context(lease)
            .inherit_from(self)
            .copy_hints(self);
        builder.map_irregular(self, Some(Mapping::Owned(mapping)), size, MapDir::L2L);
        builder.commit().map(Some)
    }

    /// Create an intercommunicator from a subgroup of this one's local group;
    /// the remote side passes its own subgroup. A side whose subgroup is empty
    /// yields `None` everywhere. Collective over both groups.
    pub fn create_inter(self: &Arc<Self>, group: &Group) -> Result<Option<Arc<Comm>>> {
        self.ensure_usable()?;
        if !self.is_intercomm() {
            return Err(Error::InvalidCommunicator);
        }
        let shared = self.shared()?;
        let mapping = group_to_ranks(self.local_group(), group)?;

        let local = self.local_comm()?;
        let lease = shared.context_ids.allocate(shared.device.as_ref(), &local.scope())?;

        let mut payload = Vec::with_capacity(mapping.len() + 2);
        payload.push(i64::from(lease.id().raw()));
        payload.push(mapping.len() as i64);
        payload.extend(mapping.iter().map(|&r| r as i64));
        let remote = shared.device.allgather(&self.scope(), &payload)?;
        let (send, remote_mapping) = decode_subset(&remote, self.remote_size())?;

        if mapping.is_empty() || remote_mapping.is_empty() {
            return Ok(None);
        }
        if group.rank_of(shared.my_lpid).is_none() {
            return Ok(None);
        }

        let (local_n, remote_n) = (mapping.len(), remote_mapping.len());
        let mut builder = CommBuilder::new(&shared)?
            .kind(CommKind::Inter)
            .inter_context(send, lease)
            .low_group(self.is_low_group())
            .inherit_from(self)
            .copy_hints(self);
        builder.map_irregular(self, Some(Mapping::Owned(mapping)), local_n, MapDir::L2L);
        builder.map_irregular(self, Some(Mapping::Owned(remote_mapping)), remote_n, MapDir::R2R);
        builder.commit().map(Some)
    }

    /// Create an intercommunicator between the group of this communicator and
    /// the group led by `remote_leader` of `peer_comm`.
    ///
    /// The two leaders (`local_leader` here, `remote_leader` in `peer_comm`)
    /// exchange context ids and member lists over `peer_comm` on `tag`, then
    /// broadcast what they received to their group. Collective over this
    /// communicator; `peer_comm` is only used by the leaders.
    pub fn intercomm_create(
        self: &Arc<Self>,
        local_leader: usize,
        peer_comm: &Arc<Comm>,
        remote_leader: usize,
        tag: i32,
    ) -> Result<Arc<Comm>> {
        self.ensure_usable()?;
        if self.is_intercomm() {
            return Err(Error::InvalidCommunicator);
        }
        if local_leader >= self.size() {
            return Err(Error::InvalidRank(local_leader as i32));
        }
        let shared = self.shared()?;
        let lease = shared.context_ids.allocate(shared.device.as_ref(), &self.scope())?;

        let mut remote = Vec::new();
        if self.rank() == local_leader {
            peer_comm.ensure_usable()?;
            if remote_leader >= peer_comm.size() {
                return Err(Error::InvalidRank(remote_leader as i32));
            }
            let mut payload = Vec::with_capacity(self.size() + 2);
            payload.push(i64::from(lease.id().raw()));
            payload.push(self.size() as i64);
            payload.extend(self.local_lpids().iter().map(|&p| p as i64));
            remote = shared
                .device
                .sendrecv(&peer_comm.scope(), remote_leader, tag, &payload)?;
        }
        shared.device.bcast(&self.scope(), local_leader, &mut remote)?;

        let (send, remote_lpids) = decode_members(&remote)?;
        let my_leader = self
            .lpid(local_leader)
            .ok_or(Error::InvalidRank(local_leader as i32))?;
        let their_leader = *remote_lpids
            .first()
            .ok_or_else(|| Error::InvalidGroup("empty remote group".into()))?;
        if remote_lpids.iter().any(|p| self.local_lpids().contains(p)) {
            return Err(Error::InvalidGroup(
                "local and remote groups overlap".into(),
            ));
        }

        let mut builder = CommBuilder::new(&shared)?
            .kind(CommKind::Inter)
            .inter_context(send, lease)
            .low_group(my_leader < their_leader)
            .members(self.local_lpids().to_vec(), Some(remote_lpids))
            .tainted();
        builder.map_dup(self, MapDir::L2L);
        let comm = builder.commit()?;
        tracing::debug!(
            handle = %comm.handle(),
            remote_size = comm.remote_size(),
            low_group = comm.is_low_group(),
            "intercommunicator created"
        );
        Ok(comm)
    }

    /// Intracommunicator view of an intercommunicator's local group.
    ///
    /// Built on first use and owned by the intercommunicator; callers that keep
    /// it beyond the intercommunicator's life must [`add_ref`](Self::add_ref) it.
    pub fn local_comm(self: &Arc<Self>) -> Result<Arc<Comm>> {
        if !self.is_intercomm() {
            return Err(Error::InvalidCommunicator);
        }
        if let Some(local) = self.cached_local_comm() {
            return Ok(local);
        }
        let shared = self.shared()?;
        let mut builder = CommBuilder::new(&shared)?
            .borrowed_context(self.recv_context_id().localcomm())
            .hierarchy_kind(HierarchyKind::Flat)
            .inherit_from(self)
            .copy_hints(self)
            .skip_hint_check();
        builder.map_dup(self, MapDir::L2L);
        let local = builder.commit()?;
        let kept = self.set_local_comm(Arc::clone(&local));
        if !Arc::ptr_eq(&kept, &local) {
            // lost a race with another thread of this process
            if let Err(e) = local.release() {
                tracing::warn!(error = %e, "failed to release duplicate local communicator");
            }
        }
        Ok(kept)
    }
}

/// Ranks in `parent` of the members of `group`, in group order.
fn group_to_ranks(parent: &Group, group: &Group) -> Result<Vec<usize>> {
    group
        .lpids()
        .iter()
        .map(|&p| {
            parent
                .rank_of(p)
                .ok_or_else(|| Error::InvalidGroup(format!("process {p} is not a member")))
        })
        .collect()
}

fn remote_context(gathered: &[i64]) -> Result<ContextId> {
    let raw = *gathered
        .first()
        .ok_or_else(|| Error::Internal("empty context exchange".into()))?;
    u32::try_from(raw)
        .map(ContextId::from_raw)
        .map_err(|_| Error::Internal(format!("invalid context id {raw}")))
}

/// Decode `[context, n, ranks...]` repeated once per remote rank.
fn decode_subset(gathered: &[i64], remote_size: usize) -> Result<(ContextId, Vec<usize>)> {
    if remote_size == 0 || gathered.len() % remote_size != 0 {
        return Err(Error::Internal("malformed subgroup exchange".into()));
    }
    let one = &gathered[..gathered.len() / remote_size];
    let send = remote_context(one)?;
    let n = one.get(1).copied().unwrap_or(-1);
    if n < 0 || one.len() != n as usize + 2 {
        return Err(Error::Internal("malformed subgroup exchange".into()));
    }
    Ok((send, one[2..].iter().map(|&r| r as usize).collect()))
}

/// Decode `[context, n, lpids...]`.
fn decode_members(buf: &[i64]) -> Result<(ContextId, Vec<Lpid>)> {
    let send = remote_context(buf)?;
    let n = buf.get(1).copied().unwrap_or(-1);
    if n < 0 || buf.len() != n as usize + 2 {
        return Err(Error::Internal("malformed leader exchange".into()));
    }
    Ok((send, buf[2..].iter().map(|&p| p as Lpid).collect()))
}

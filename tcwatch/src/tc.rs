//! TC hook management: the clsact qdisc and the classifier filters.
//!
//! The qdisc is created only when no clsact qdisc with the canonical handle
//! is already installed (other tools may own one), and is deleted on
//! teardown, which implicitly removes both attached filters.

use aya::programs::{tc::NlOptions, tc::TcAttachOptions, SchedClassifier, TcAttachType};
use aya::Ebpf;
use futures::StreamExt;
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::tc::{TcAttribute, TcHandle, TcMessage};
use netlink_packet_route::RouteNetlinkMessage;
use rtnetlink::Handle;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ebpf::{PROG_EGRESS, PROG_INGRESS};
use crate::iface::NetInterface;

/// Canonical classifier qdisc handle, ffff:0.
const CLSACT_MAJOR: u16 = 0xffff;
/// Parent for clsact qdisc creation (TC_H_CLSACT).
const TC_H_CLSACT: u32 = 0xFFFF_FFF1;
/// Filter handle 0:1 on both attach parents.
const FILTER_HANDLE: u32 = 1;

const CLSACT_KIND: &str = "clsact";

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("program {0} missing from classifier object")]
    MissingProgram(&'static str),
    #[error("failed to attach {program}: {source}")]
    Attach {
        program: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },
}

fn clsact_message(if_index: i32) -> TcMessage {
    let mut message = TcMessage::with_index(if_index);
    message.header.handle = TcHandle {
        major: CLSACT_MAJOR,
        minor: 0,
    };
    message.header.parent = TcHandle::from(TC_H_CLSACT);
    message
        .attributes
        .push(TcAttribute::Kind(CLSACT_KIND.to_string()));
    message
}

/// Issue a request and drain the response stream, failing on the first
/// error payload. An ack (error code zero) is not a failure.
async fn netlink_execute(
    mut handle: Handle,
    request: NetlinkMessage<RouteNetlinkMessage>,
) -> Result<(), rtnetlink::Error> {
    let mut responses = handle.request(request)?;
    while let Some(response) = responses.next().await {
        if let NetlinkPayload::Error(err) = response.payload {
            if err.code.is_some() {
                return Err(rtnetlink::Error::NetlinkError(err));
            }
        }
    }
    Ok(())
}

/// Attaches the classifier programs to a device and hands back the state
/// needed to undo it.
pub struct HookAttacher {
    netlink: Handle,
}

impl HookAttacher {
    pub fn new(netlink: Handle) -> Self {
        Self { netlink }
    }

    /// Ensure the clsact qdisc and attach both classifier filters. A filter
    /// attach failure releases the qdisc before returning.
    pub async fn attach(
        &self,
        bpf: &mut Ebpf,
        iface: &NetInterface,
    ) -> Result<AttachedHooks, AttachError> {
        self.ensure_clsact(iface).await?;

        for (name, attach_type) in [
            (PROG_INGRESS, TcAttachType::Ingress),
            (PROG_EGRESS, TcAttachType::Egress),
        ] {
            if let Err(err) = attach_filter(bpf, iface, name, attach_type) {
                delete_clsact(self.netlink.clone(), iface).await;
                return Err(err);
            }
        }

        info!(
            "attached {} and {} to {}",
            PROG_INGRESS, PROG_EGRESS, iface.name
        );
        Ok(AttachedHooks {
            iface: iface.clone(),
            netlink: self.netlink.clone(),
            armed: true,
        })
    }

    async fn ensure_clsact(&self, iface: &NetInterface) -> Result<(), AttachError> {
        if self.clsact_exists(iface).await? {
            debug!("clsact qdisc already present on {}, reusing", iface.name);
            return Ok(());
        }

        let mut request = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(
            clsact_message(iface.index as i32),
        ));
        request.header.flags = NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL;

        match netlink_execute(self.netlink.clone(), request).await {
            Ok(()) => Ok(()),
            // Lost the race against another installer; reusing is fine.
            Err(rtnetlink::Error::NetlinkError(ref err))
                if err.code.map(|code| code.get()) == Some(-libc::EEXIST) =>
            {
                debug!("clsact qdisc already exists on {}, reusing", iface.name);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn clsact_exists(&self, iface: &NetInterface) -> Result<bool, AttachError> {
        // Index 0 dumps qdiscs for every device; filter on ours below.
        let mut request =
            NetlinkMessage::from(RouteNetlinkMessage::GetQueueDiscipline(TcMessage::with_index(0)));
        request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut handle = self.netlink.clone();
        let mut responses = handle.request(request).map_err(AttachError::Netlink)?;
        let mut found = false;
        while let Some(response) = responses.next().await {
            match response.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewQueueDiscipline(tc)) => {
                    let handle_matches =
                        tc.header.handle.major == CLSACT_MAJOR && tc.header.handle.minor == 0;
                    let kind_matches = tc
                        .attributes
                        .iter()
                        .any(|attr| matches!(attr, TcAttribute::Kind(kind) if kind == CLSACT_KIND));
                    if tc.header.index == iface.index as i32 && handle_matches && kind_matches {
                        found = true;
                    }
                }
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(rtnetlink::Error::NetlinkError(err).into());
                }
                _ => {}
            }
        }
        Ok(found)
    }
}

fn attach_filter(
    bpf: &mut Ebpf,
    iface: &NetInterface,
    name: &'static str,
    attach_type: TcAttachType,
) -> Result<(), AttachError> {
    let program: &mut SchedClassifier = bpf
        .program_mut(name)
        .ok_or(AttachError::MissingProgram(name))?
        .try_into()
        .map_err(|source| AttachError::Attach {
            program: name,
            source,
        })?;
    program
        .attach_with_options(
            &iface.name,
            attach_type,
            TcAttachOptions::Netlink(NlOptions {
                priority: 0,
                handle: FILTER_HANDLE,
            }),
        )
        .map_err(|source| AttachError::Attach {
            program: name,
            source,
        })?;
    Ok(())
}

async fn delete_clsact(netlink: Handle, iface: &NetInterface) {
    let mut request = NetlinkMessage::from(RouteNetlinkMessage::DelQueueDiscipline(clsact_message(
        iface.index as i32,
    )));
    request.header.flags = NLM_F_REQUEST | NLM_F_ACK;

    match netlink_execute(netlink, request).await {
        Ok(()) => debug!("removed clsact qdisc from {}", iface.name),
        Err(err) => warn!("failed to remove clsact qdisc from {}: {err}", iface.name),
    }
}

/// Kernel hook state for one device. Must be torn down on every exit path;
/// teardown failures are logged, never fatal.
///
/// Stays armed until [`teardown`](Self::teardown) runs; dropping an armed
/// value (a panic unwinding past the owner) falls back to a detached
/// cleanup task so the qdisc is not leaked.
pub struct AttachedHooks {
    iface: NetInterface,
    netlink: Handle,
    armed: bool,
}

impl AttachedHooks {
    /// Delete the clsact qdisc, implicitly removing both filters.
    pub async fn teardown(mut self) {
        self.armed = false;
        delete_clsact(self.netlink.clone(), &self.iface).await;
    }
}

impl Drop for AttachedHooks {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let netlink = self.netlink.clone();
        let iface = self.iface.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { delete_clsact(netlink, &iface).await });
            }
            Err(_) => warn!(
                "leaking clsact qdisc on {}: no runtime available for cleanup",
                iface.name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clsact_message_uses_canonical_handles() {
        let message = clsact_message(7);
        assert_eq!(message.header.index, 7);
        assert_eq!(message.header.handle.major, 0xffff);
        assert_eq!(message.header.handle.minor, 0);
        assert_eq!(message.header.parent, TcHandle::from(TC_H_CLSACT));
        assert!(message
            .attributes
            .iter()
            .any(|attr| matches!(attr, TcAttribute::Kind(kind) if kind == "clsact")));
    }
}

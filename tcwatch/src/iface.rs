use futures::TryStreamExt;
use netlink_packet_route::link::{LinkAttribute, LinkFlag};
use rtnetlink::Handle;
use thiserror::Error;

/// A resolved network device.
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("netlink connection failed: {0}")]
    Connection(#[from] std::io::Error),
    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),
    #[error("interface {0} not found")]
    NotFound(String),
}

/// Owns the rtnetlink connection and resolves devices by name.
pub struct InterfaceManager {
    handle: Handle,
}

impl InterfaceManager {
    pub fn new() -> Result<Self, IfaceError> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Resolve a single device by name.
    pub async fn resolve(&self, name: &str) -> Result<NetInterface, IfaceError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(NetInterface {
                name: name.to_string(),
                index: link.header.index,
            }),
            Ok(None) => Err(IfaceError::NotFound(name.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Enumerate every device that is administratively up.
    pub async fn up_interfaces(&self) -> Result<Vec<NetInterface>, IfaceError> {
        let mut links = self.handle.link().get().execute();
        let mut interfaces = Vec::new();
        while let Some(link) = links.try_next().await? {
            if !link.header.flags.contains(&LinkFlag::Up) {
                continue;
            }
            let name = link.attributes.iter().find_map(|attr| match attr {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            });
            if let Some(name) = name {
                interfaces.push(NetInterface {
                    name,
                    index: link.header.index,
                });
            }
        }
        Ok(interfaces)
    }
}

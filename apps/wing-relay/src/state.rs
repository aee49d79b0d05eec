use std::sync::Arc;

use tracing::info;
use wing_proto::NodeStatus;

use crate::{
    auth::AuthContext,
    config::{AppConfig, NodeRole},
    gossip::{BandwidthMeter, EdgeSync, GossipError, LoginClient, LoginNode, OrgCache},
    identity::{IdentityProvider, LocalIdentity, RemoteIdentity},
    pending::PendingTables,
    registry::WingRegistry,
    sessions::RemoteSessionTable,
    store::RelayStore,
    tasks::TaskPipeline,
};

/// Role-specific half of the gossip protocol this process runs.
#[derive(Clone)]
pub enum Node {
    Login(Arc<LoginNode>),
    Edge(Arc<EdgeSync>),
}

impl Node {
    pub fn status(&self) -> NodeStatus {
        match self {
            Node::Login(login) => login.status(),
            Node::Edge(edge) => edge.status(),
        }
    }

    pub fn as_login(&self) -> Option<&Arc<LoginNode>> {
        match self {
            Node::Login(login) => Some(login),
            Node::Edge(_) => None,
        }
    }

    pub fn as_edge(&self) -> Option<&Arc<EdgeSync>> {
        match self {
            Node::Edge(edge) => Some(edge),
            Node::Login(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn RelayStore>,
    pub registry: WingRegistry,
    pub pending: PendingTables,
    pub sessions: Arc<RemoteSessionTable>,
    pub tasks: TaskPipeline,
    pub auth: AuthContext,
    pub meter: Arc<BandwidthMeter>,
    pub orgs: Arc<OrgCache>,
    pub node: Node,
}

impl AppState {
    pub fn build(config: AppConfig, store: Arc<dyn RelayStore>) -> Result<Self, GossipError> {
        let registry = WingRegistry::new(config.subscriber_buffer);
        let meter = Arc::new(BandwidthMeter::default());
        let orgs = Arc::new(OrgCache::default());

        let (node, identity): (Node, Arc<dyn IdentityProvider>) = match config.node_role {
            NodeRole::Login => {
                let login = LoginNode::new(&config, Arc::clone(&store), registry.clone(), Arc::clone(&meter));
                (Node::Login(login), Arc::new(LocalIdentity::new(Arc::clone(&store))))
            }
            NodeRole::Edge => {
                let login_url = config.login_url.clone().ok_or(GossipError::NoLogin)?;
                let client = LoginClient::new(login_url, config.node_secret.clone(), config.request_timeout());
                let identity: Arc<dyn IdentityProvider> =
                    Arc::new(RemoteIdentity::new(client.clone(), Arc::clone(&orgs)));
                let edge = EdgeSync::new(
                    config.machine_id.clone(),
                    config.public_url.clone(),
                    Arc::new(client),
                    registry.clone(),
                    Arc::clone(&meter),
                    Arc::clone(&orgs),
                    Arc::clone(&identity),
                    config.write_timeout(),
                );
                (Node::Edge(edge), identity)
            }
        };
        info!(role = config.node_role.as_str(), machine_id = %config.machine_id, "relay node initialised");

        let auth = AuthContext::new(
            config.jwt_secret.as_deref(),
            config.jwt_issuer.as_deref(),
            identity,
        );
        let tasks = TaskPipeline::new(
            Arc::clone(&store),
            registry.clone(),
            config.dispatch_timeout(),
            config.subscriber_buffer,
        );

        Ok(Self {
            sessions: Arc::new(RemoteSessionTable::new(config.subscriber_buffer)),
            pending: PendingTables::default(),
            config: Arc::new(config),
            store,
            registry,
            tasks,
            auth,
            meter,
            orgs,
            node,
        })
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        self.auth.identity()
    }
}

use crate::catalog::{ActionCatalog, KnownActionsCatalog, PermissiveCatalog};
use crate::dispatch::Dispatcher;
use crate::keystore::{KeyStore, SigningKeypair};
use crate::networking::network::Network;
use crate::networking::node::Node;
use crate::pending::PendingRequestTable;
use crate::routing::{NodeId, NodeRole};
use crate::signature::{
    Direction, FieldSelector, SignaturePolicy, SigningRule, UnsignedPolicy, VerifyMode,
};
use crate::time::create_timestamp;
use clap::{App, Arg};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{event, Level};

/// A signing or verify key entry in the settings file.
#[derive(Deserialize, Debug, Clone)]
pub struct KeySetting {
    pub id: String,
    #[serde(default)]
    pub secret_hex: Option<String>,
    #[serde(default)]
    pub public_hex: Option<String>,
}

/// A symmetric cipher key entry in the settings file.
#[derive(Deserialize, Debug, Clone)]
pub struct CipherKeySetting {
    pub id: u16,
    pub key_hex: String,
}

/// A signing-policy rule in the settings file. Absent fields match anything.
#[derive(Deserialize, Debug, Clone)]
pub struct RuleSetting {
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub key_id: String,
    #[serde(default)]
    pub fields: Option<Vec<String>>,
}

fn parse_role(name: &str) -> crate::Result<NodeRole> {
    match name {
        "charging_station" => Ok(NodeRole::ChargingStation),
        "networking_node" => Ok(NodeRole::NetworkingNode),
        "csms" => Ok(NodeRole::Csms),
        other => Err(crate::Error::Transport(format!(
            "unknown node role in settings: {}",
            other
        ))),
    }
}

fn parse_direction(name: &str) -> crate::Result<Direction> {
    match name {
        "inbound" => Ok(Direction::Inbound),
        "outbound" => Ok(Direction::Outbound),
        other => Err(crate::Error::Transport(format!(
            "unknown rule direction in settings: {}",
            other
        ))),
    }
}

fn load_keystore(settings: &config::Config) -> crate::Result<KeyStore> {
    let mut keys = KeyStore::new();
    if let Ok(signing) = settings.get::<Vec<KeySetting>>("keys.signing") {
        for entry in signing {
            let secret_hex = entry.secret_hex.ok_or_else(|| {
                crate::Error::Transport(format!("signing key {} has no secret_hex", entry.id))
            })?;
            keys.add_signing(&entry.id, SigningKeypair::from_secret_hex(&secret_hex)?);
        }
    }
    if let Ok(verify) = settings.get::<Vec<KeySetting>>("keys.verify") {
        for entry in verify {
            let public_hex = entry.public_hex.ok_or_else(|| {
                crate::Error::Transport(format!("verify key {} has no public_hex", entry.id))
            })?;
            keys.add_verify_hex(&entry.id, &public_hex)?;
        }
    }
    if let Ok(cipher) = settings.get::<Vec<CipherKeySetting>>("keys.cipher") {
        for entry in cipher {
            keys.add_cipher_hex(entry.id, &entry.key_hex)?;
        }
    }
    Ok(keys)
}

fn load_signature_policy(settings: &config::Config) -> crate::Result<SignaturePolicy> {
    let mut policy = SignaturePolicy::new();
    if let Ok(unsigned) = settings.get::<String>("policy.unsigned") {
        policy.unsigned = match unsigned.as_str() {
            "allow" => UnsignedPolicy::Allow,
            "reject" => UnsignedPolicy::Reject,
            other => {
                return Err(crate::Error::Transport(format!(
                    "unknown unsigned policy in settings: {}",
                    other
                )))
            }
        };
    }
    if let Ok(mode) = settings.get::<String>("policy.verify_mode") {
        policy.verify_mode = match mode.as_str() {
            "all" => VerifyMode::All,
            "any" => VerifyMode::Any,
            other => {
                return Err(crate::Error::Transport(format!(
                    "unknown verify mode in settings: {}",
                    other
                )))
            }
        };
    }
    if let Ok(rules) = settings.get::<Vec<RuleSetting>>("policy.rules") {
        for rule in rules {
            let direction = rule.direction.as_deref().map(parse_direction).transpose()?;
            let role = rule.role.as_deref().map(parse_role).transpose()?;
            let selector = match rule.fields {
                Some(fields) => FieldSelector::Fields(fields),
                None => FieldSelector::AllPresent,
            };
            policy.push_rule(SigningRule {
                direction,
                action: rule.action,
                role,
                key_id: rule.key_id,
                selector,
            });
        }
    }
    Ok(policy)
}

fn load_catalog(settings: &config::Config) -> Arc<dyn ActionCatalog> {
    match settings.get::<Vec<String>>("catalog.actions") {
        Ok(actions) => Arc::new(KnownActionsCatalog::new(actions)),
        Err(_) => Arc::new(PermissiveCatalog),
    }
}

///
/// The entry point to the gridmesh runtime
///
pub async fn run() -> crate::Result<()> {
    //
    // handle shutdown messages w/ broadcast channel
    //
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    let mut mesh = Mesh {
        _notify_shutdown: notify_shutdown,
        _shutdown_complete_tx: shutdown_complete_tx,
        _shutdown_complete_rx: shutdown_complete_rx,
    };

    tokio::select! {
        res = mesh.run() => {
            if let Err(err) = res {
                eprintln!("{:?}", err);
            }
        },
        _ = signal::ctrl_c() => {
            println!("Shutting down!")
        }
    }

    Ok(())
}

//
// The mesh state exposes a run method that main calls to initialize
// node state and prepare for shutdown.
//
struct Mesh {
    _notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_rx: mpsc::Receiver<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl Mesh {
    async fn run(&mut self) -> crate::Result<()> {
        //
        // handle command-line arguments
        //
        let matches = App::new("Gridmesh Runtime")
            .about("Runs a gridmesh node")
            .arg(
                Arg::with_name("config")
                    .short("c")
                    .long("config")
                    .takes_value(true)
                    .help("config file name"),
            )
            .get_matches();

        let config_name = match matches.value_of("config") {
            Some(name) => name,
            None => "config",
        };

        let mut settings = config::Config::default();
        settings.merge(config::File::with_name(config_name))?;

        //
        // node identity
        //
        let node_id = NodeId::new(&settings.get::<String>("node.id")?);
        let role = parse_role(&settings.get::<String>("node.role")?)?;
        let binary_wire = settings.get::<bool>("wire.binary").unwrap_or(false);
        let timeout_ms = settings.get::<u64>("request.timeout_ms").unwrap_or(30_000);

        //
        // keys, policy and dispatch
        //
        let keys = Arc::new(load_keystore(&settings)?);
        let policy = load_signature_policy(&settings)?;
        let catalog = load_catalog(&settings);
        let dispatcher = Arc::new(Dispatcher::new(role, catalog, policy, keys));

        let pending = Arc::new(PendingRequestTable::new());
        PendingRequestTable::spawn_sweeper(pending.clone(), Duration::from_millis(1000));

        let node = Arc::new(Node::new(
            node_id,
            role,
            dispatcher,
            pending,
            binary_wire,
            Duration::from_millis(timeout_ms),
        ));

        //
        // relay entries for requests we forwarded expire like pending
        // requests do, on their own clock
        //
        let relay_node = node.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10_000)).await;
                let purged = relay_node.purge_stale_relays(create_timestamp()).await;
                if purged > 0 {
                    event!(Level::DEBUG, "purged {} stale relay entries", purged);
                }
            }
        });

        event!(
            Level::INFO,
            "starting node {} as {:?}",
            node.node_id,
            node.role
        );

        let network = Network::new(settings, node);
        network.run().await
    }
}

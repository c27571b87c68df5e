use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use shardraft::config::{NodeConfig, ShardingConfig};
use shardraft::error::RaftError;
use shardraft::grpc::client::channel;
use shardraft::node::{Node, Startup};
use shardraft::proto::admin_service_client::AdminServiceClient;
use shardraft::proto::{self, InfoResponse};
use shardraft::shard::key_slot;
use shardraft::shutdown::install_shutdown_handler;
use shardraft::statemachine::KvStateMachine;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "shardraft")]
#[command(version)]
#[command(about = "A Raft consensus node with shard-group routing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a shardraft server node
    Server(ServerArgs),

    /// Create or join a cluster
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Add or remove cluster members
    Node {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: NodeCommands,
    },

    /// Hand leadership to another voter
    TransferLeader {
        #[command(flatten)]
        client: ClientArgs,

        /// Target node id
        target: u64,
    },

    /// Show node and cluster state
    Info {
        #[command(flatten)]
        client: ClientArgs,
    },

    /// Shard group management commands
    Shardgroup {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ShardGroupCommands,
    },

    /// Submit a batch of operations (e.g. "SET k v" "GET k")
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Key used to compute the hash slot for routing
        #[arg(long, conflicts_with = "slot")]
        key: Option<String>,

        /// Explicit hash slot for routing
        #[arg(long)]
        slot: Option<u32>,

        #[arg(required = true)]
        ops: Vec<String>,
    },

    /// Runtime configuration
    Config {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Debugging aids
    Debug {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Requested node id (0 lets the cluster choose)
    #[arg(long, default_value = "0")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "5001")]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Address peers use to reach this node (default: 127.0.0.1:<port>)
    #[arg(long)]
    advertise_addr: Option<String>,

    /// Directory for the log, state and snapshots (in-memory when omitted)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Create a new cluster on first start
    #[arg(long, conflicts_with = "join")]
    init: bool,

    /// Join an existing cluster on first start (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    join: Vec<String>,

    /// Enable shard-group routing
    #[arg(long)]
    sharding: bool,

    /// Slot range owned by this group, as start:end
    #[arg(long, default_value = "0:16383", requires = "sharding")]
    slots: String,

    /// Entries applied past the last snapshot before a new one is taken
    #[arg(long)]
    snapshot_threshold: Option<u64>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address (host:port)
    #[arg(long, short = 'a', default_value = "127.0.0.1:5001")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// Create a new single-node cluster
    Init,
    /// Join an existing cluster through any of the given nodes
    Join {
        #[arg(required = true)]
        addrs: Vec<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum NodeCommands {
    /// Admit a node (id 0 lets the cluster choose)
    Add {
        #[arg(long, default_value = "0")]
        id: u64,
        #[arg(long)]
        node_addr: String,
    },
    /// Remove a node
    Remove { id: u64 },
}

#[derive(clap::Subcommand, Debug)]
enum ShardGroupCommands {
    /// Show the local shard group
    Get,
    /// Record a remote shard group
    Add(ShardGroupArgs),
    /// Replace a recorded shard group
    Update(ShardGroupArgs),
    /// Fetch a remote cluster's shard group and record it
    Link { remote_addr: String },
}

#[derive(Parser, Debug)]
struct ShardGroupArgs {
    /// Cluster id (dbid) of the group
    #[arg(long)]
    id: String,
    /// Slot range as start:end
    #[arg(long)]
    slots: String,
    /// Member as id=host:port (repeatable)
    #[arg(long = "member")]
    members: Vec<String>,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigCommands {
    /// Show parameters matching a pattern (`*` wildcard)
    Get {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Set one parameter
    Set { name: String, value: String },
}

#[derive(clap::Subcommand, Debug)]
enum DebugCommands {
    /// Take a snapshot now, delaying the write
    Compact {
        #[arg(long, default_value = "0")]
        delay_ms: u64,
    },
    /// Force the next replication to a follower to use a snapshot
    SendSnapshot { id: u64 },
    /// List every node id ever assigned
    UsedNodeIds,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeOutput {
    id: u64,
    addr: String,
    voting: bool,
    connection: String,
}

#[derive(Serialize)]
struct InfoOutput {
    node_id: u64,
    dbid: Option<String>,
    cluster_state: String,
    role: String,
    term: u64,
    leader_id: Option<u64>,
    leader_addr: Option<String>,
    commit_index: u64,
    last_applied: u64,
    first_log_index: u64,
    last_log_index: u64,
    snapshot_last_index: u64,
    snapshot_last_term: u64,
    snapshot_in_progress: bool,
    pending_requests: u64,
    shard_groups: u64,
    failure: Option<String>,
    nodes: Vec<NodeOutput>,
}

impl From<InfoResponse> for InfoOutput {
    fn from(info: InfoResponse) -> Self {
        Self {
            node_id: info.node_id,
            dbid: info.dbid,
            cluster_state: info.cluster_state,
            role: info.role,
            term: info.term,
            leader_id: info.leader_id,
            leader_addr: info.leader_addr,
            commit_index: info.commit_index,
            last_applied: info.last_applied,
            first_log_index: info.first_log_index,
            last_log_index: info.last_log_index,
            snapshot_last_index: info.snapshot_last_index,
            snapshot_last_term: info.snapshot_last_term,
            snapshot_in_progress: info.snapshot_in_progress,
            pending_requests: info.pending_requests,
            shard_groups: info.shard_groups,
            failure: info.failure,
            nodes: info
                .nodes
                .into_iter()
                .map(|n| NodeOutput {
                    id: n.id,
                    addr: n.addr,
                    voting: n.voting,
                    connection: n.connection,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct ShardGroupNodeOutput {
    id: u64,
    addr: String,
}

#[derive(Serialize)]
struct ShardGroupOutput {
    id: String,
    start_slot: u32,
    end_slot: u32,
    nodes: Vec<ShardGroupNodeOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_slot_range(value: &str) -> CliResult<(u32, u32)> {
    let (start, end) = value
        .split_once(':')
        .ok_or_else(|| format!("invalid slot range '{value}', expected start:end"))?;
    Ok((start.trim().parse()?, end.trim().parse()?))
}

fn parse_member(value: &str) -> CliResult<proto::ShardGroupNodeMessage> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("invalid member '{value}', expected id=host:port"))?;
    Ok(proto::ShardGroupNodeMessage {
        id: id.trim().parse()?,
        addr: addr.trim().to_string(),
    })
}

fn shard_group_message(args: ShardGroupArgs) -> CliResult<proto::ShardGroupMessage> {
    let (start_slot, end_slot) = parse_slot_range(&args.slots)?;
    Ok(proto::ShardGroupMessage {
        id: args.id,
        start_slot,
        end_slot,
        nodes: args
            .members
            .iter()
            .map(|m| parse_member(m))
            .collect::<CliResult<_>>()?,
    })
}

fn connect(client: &ClientArgs) -> CliResult<AdminServiceClient<Channel>> {
    Ok(AdminServiceClient::new(channel(
        &client.addr,
        Duration::from_secs(5),
    )?))
}

/// Prints a one-line confirmation in the chosen format.
fn print_ok(output: &OutputFormat, message: &str) -> CliResult {
    match output {
        OutputFormat::Json => println!("{}", serde_json::json!({ "ok": true, "message": message })),
        OutputFormat::Table => println!("OK {message}"),
    }
    Ok(())
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let advertise_addr = args
        .advertise_addr
        .unwrap_or_else(|| format!("127.0.0.1:{}", args.port));

    let mut config = NodeConfig::new(args.node_id, listen_addr).with_advertise_addr(advertise_addr);
    config.data_dir = args.data_dir;
    if let Some(threshold) = args.snapshot_threshold {
        config.snapshot_threshold = threshold;
    }
    if args.sharding {
        let (start, end) = parse_slot_range(&args.slots)?;
        config.sharding = ShardingConfig {
            enabled: true,
            start_slot: u16::try_from(start)?,
            end_slot: u16::try_from(end)?,
        };
    }

    let startup = if args.init {
        Startup::Init
    } else if !args.join.is_empty() {
        Startup::Join(args.join)
    } else {
        Startup::Manual
    };

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        advertise_addr = %config.public_addr(),
        data_dir = ?config.data_dir,
        sharding = config.sharding.enabled,
        startup = ?startup,
        "Starting shardraft node"
    );

    let node = Node::new(config, Box::new(KvStateMachine::new()))?;
    let shutdown = install_shutdown_handler();
    node.run(startup, shutdown).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_info(client: &mut AdminServiceClient<Channel>, output: &OutputFormat) -> CliResult {
    let info = client
        .info(proto::Empty {})
        .await
        .map_err(RaftError::from)?
        .into_inner();

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&InfoOutput::from(info))?);
        }
        OutputFormat::Table => {
            println!("Node Info");
            println!("{}", "=".repeat(40));
            println!("Node ID:       {}", info.node_id);
            println!("Cluster ID:    {}", info.dbid.as_deref().unwrap_or("-"));
            println!("State:         {}", info.cluster_state);
            println!("Role:          {}", info.role);
            println!("Term:          {}", info.term);
            match info.leader_id {
                Some(id) => println!(
                    "Leader:        Node {} ({})",
                    id,
                    info.leader_addr.as_deref().unwrap_or("-")
                ),
                None => println!("Leader:        -"),
            }
            println!("Commit index:  {}", info.commit_index);
            println!("Last applied:  {}", info.last_applied);
            println!("Log:           {}..{}", info.first_log_index, info.last_log_index);
            println!(
                "Snapshot:      {}/{}{}",
                info.snapshot_last_index,
                info.snapshot_last_term,
                if info.snapshot_in_progress { " (in progress)" } else { "" }
            );
            println!("Pending:       {}", info.pending_requests);
            println!("Shard groups:  {}", info.shard_groups);
            if let Some(failure) = &info.failure {
                println!("Failure:       {failure}");
            }
            println!();
            println!("Nodes:");
            println!("{:<12} {:<25} {:<10} CONNECTION", "ID", "ADDRESS", "ROLE");
            println!("{}", "-".repeat(60));
            for node in info.nodes {
                let role = if node.voting { "voter" } else { "non-voter" };
                println!("{:<12} {:<25} {:<10} {}", node.id, node.addr, role, node.connection);
            }
        }
    }
    Ok(())
}

async fn handle_shard_group_get(
    client: &mut AdminServiceClient<Channel>,
    output: &OutputFormat,
) -> CliResult {
    let group = client
        .shard_group_get(proto::Empty {})
        .await
        .map_err(RaftError::from)?
        .into_inner();

    match output {
        OutputFormat::Json => {
            let out = ShardGroupOutput {
                id: group.id,
                start_slot: group.start_slot,
                end_slot: group.end_slot,
                nodes: group
                    .nodes
                    .into_iter()
                    .map(|n| ShardGroupNodeOutput { id: n.id, addr: n.addr })
                    .collect(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Shard group {}", group.id);
            println!("Slots: {}-{}", group.start_slot, group.end_slot);
            println!("{:<12} ADDRESS", "ID");
            for node in group.nodes {
                println!("{:<12} {}", node.id, node.addr);
            }
        }
    }
    Ok(())
}

async fn handle_submit(
    client: &mut AdminServiceClient<Channel>,
    ops: Vec<String>,
    slot: Option<u32>,
    output: &OutputFormat,
) -> CliResult {
    let resp = client
        .submit(proto::SubmitRequest {
            ops: ops.into_iter().map(String::into_bytes).collect(),
            slot,
        })
        .await
        .map_err(RaftError::from)?
        .into_inner();

    let replies: Vec<String> = resp
        .replies
        .iter()
        .map(|r| String::from_utf8_lossy(r).into_owned())
        .collect();
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&replies)?),
        OutputFormat::Table => {
            for (i, reply) in replies.iter().enumerate() {
                println!("{}) {}", i + 1, reply);
            }
        }
    }
    Ok(())
}

async fn handle_config_get(
    client: &mut AdminServiceClient<Channel>,
    pattern: String,
    output: &OutputFormat,
) -> CliResult {
    let resp = client
        .config_get(proto::ConfigGetRequest { pattern })
        .await
        .map_err(RaftError::from)?
        .into_inner();

    match output {
        OutputFormat::Json => {
            let map: serde_json::Map<String, serde_json::Value> = resp
                .entries
                .into_iter()
                .map(|e| (e.name, serde_json::Value::String(e.value)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&map)?);
        }
        OutputFormat::Table => {
            for entry in resp.entries {
                println!("{:<24} {}", entry.name, entry.value);
            }
        }
    }
    Ok(())
}

async fn handle_used_node_ids(
    client: &mut AdminServiceClient<Channel>,
    output: &OutputFormat,
) -> CliResult {
    let resp = client
        .debug_used_node_ids(proto::Empty {})
        .await
        .map_err(RaftError::from)?
        .into_inner();
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string(&resp.node_ids)?),
        OutputFormat::Table => {
            for id in resp.node_ids {
                println!("{id}");
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> CliResult {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Cluster { client, command } => {
            let mut grpc = connect(&client)?;
            match command {
                ClusterCommands::Init => {
                    let resp = grpc
                        .cluster_init(proto::Empty {})
                        .await
                        .map_err(RaftError::from)?
                        .into_inner();
                    print_ok(&client.output, &format!("cluster {} created", resp.dbid))?;
                }
                ClusterCommands::Join { addrs } => {
                    grpc.cluster_join(proto::ClusterJoinRequest { addrs })
                        .await
                        .map_err(RaftError::from)?;
                    print_ok(&client.output, "joined cluster")?;
                }
            }
        }
        Commands::Node { client, command } => {
            let mut grpc = connect(&client)?;
            match command {
                NodeCommands::Add { id, node_addr } => {
                    let resp = grpc
                        .add_node(proto::AddNodeRequest {
                            node_id: id,
                            addr: node_addr,
                        })
                        .await
                        .map_err(RaftError::from)?
                        .into_inner();
                    print_ok(
                        &client.output,
                        &format!("node {} added to cluster {}", resp.node_id, resp.dbid),
                    )?;
                }
                NodeCommands::Remove { id } => {
                    grpc.remove_node(proto::RemoveNodeRequest { node_id: id })
                        .await
                        .map_err(RaftError::from)?;
                    print_ok(&client.output, &format!("node {id} removed"))?;
                }
            }
        }
        Commands::TransferLeader { client, target } => {
            let resp = connect(&client)?
                .transfer_leader(proto::TransferLeaderRequest { target })
                .await
                .map_err(RaftError::from)?
                .into_inner();
            print_ok(&client.output, &format!("node {} is leader", resp.leader_id))?;
        }
        Commands::Info { client } => {
            handle_info(&mut connect(&client)?, &client.output).await?;
        }
        Commands::Shardgroup { client, command } => {
            let mut grpc = connect(&client)?;
            match command {
                ShardGroupCommands::Get => handle_shard_group_get(&mut grpc, &client.output).await?,
                ShardGroupCommands::Add(group) => {
                    grpc.shard_group_add(shard_group_message(group)?)
                        .await
                        .map_err(RaftError::from)?;
                    print_ok(&client.output, "shard group added")?;
                }
                ShardGroupCommands::Update(group) => {
                    grpc.shard_group_update(shard_group_message(group)?)
                        .await
                        .map_err(RaftError::from)?;
                    print_ok(&client.output, "shard group updated")?;
                }
                ShardGroupCommands::Link { remote_addr } => {
                    grpc.shard_group_link(proto::ShardGroupLinkRequest { addr: remote_addr })
                        .await
                        .map_err(RaftError::from)?;
                    print_ok(&client.output, "shard group linked")?;
                }
            }
        }
        Commands::Submit {
            client,
            key,
            slot,
            ops,
        } => {
            let slot = slot.or_else(|| key.map(|k| u32::from(key_slot(k.as_bytes()))));
            handle_submit(&mut connect(&client)?, ops, slot, &client.output).await?;
        }
        Commands::Config { client, command } => {
            let mut grpc = connect(&client)?;
            match command {
                ConfigCommands::Get { pattern } => {
                    handle_config_get(&mut grpc, pattern, &client.output).await?
                }
                ConfigCommands::Set { name, value } => {
                    grpc.config_set(proto::ConfigSetRequest {
                        name: name.clone(),
                        value,
                    })
                    .await
                    .map_err(RaftError::from)?;
                    print_ok(&client.output, &format!("{name} updated"))?;
                }
            }
        }
        Commands::Debug { client, command } => {
            let mut grpc = connect(&client)?;
            match command {
                DebugCommands::Compact { delay_ms } => {
                    let resp = grpc
                        .debug_compact(proto::DebugCompactRequest { delay_ms })
                        .await
                        .map_err(RaftError::from)?
                        .into_inner();
                    print_ok(
                        &client.output,
                        &format!("log compacted up to index {}", resp.index),
                    )?;
                }
                DebugCommands::SendSnapshot { id } => {
                    grpc.debug_send_snapshot(proto::DebugSendSnapshotRequest { node_id: id })
                        .await
                        .map_err(RaftError::from)?;
                    print_ok(&client.output, &format!("snapshot scheduled for node {id}"))?;
                }
                DebugCommands::UsedNodeIds => handle_used_node_ids(&mut grpc, &client.output).await?,
            }
        }
    }

    Ok(())
}

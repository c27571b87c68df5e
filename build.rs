use tonic_build::manual::{Builder, Method, Service};

const PACKAGE: &str = "shardraft";

fn unary(name: &str, route: &str, input: &str, output: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("crate::proto::{input}"))
        .output_type(format!("crate::proto::{output}"))
        .codec_path("tonic::codec::ProstCodec")
        .build()
}

fn main() {
    let raft_service = Service::builder()
        .name("RaftService")
        .package(PACKAGE)
        .method(unary("request_vote", "RequestVote", "RequestVoteRequest", "RequestVoteResponse"))
        .method(unary("append_entries", "AppendEntries", "AppendEntriesRequest", "AppendEntriesResponse"))
        .method(unary("install_snapshot", "InstallSnapshot", "InstallSnapshotRequest", "InstallSnapshotResponse"))
        .method(unary("timeout_now", "TimeoutNow", "TimeoutNowRequest", "Empty"))
        .method(unary("node_shutdown", "NodeShutdown", "NodeShutdownRequest", "Empty"))
        .build();

    let admin_service = Service::builder()
        .name("AdminService")
        .package(PACKAGE)
        .method(unary("submit", "Submit", "SubmitRequest", "SubmitResponse"))
        .method(unary("cluster_init", "ClusterInit", "Empty", "ClusterInitResponse"))
        .method(unary("cluster_join", "ClusterJoin", "ClusterJoinRequest", "Empty"))
        .method(unary("add_node", "AddNode", "AddNodeRequest", "AddNodeResponse"))
        .method(unary("remove_node", "RemoveNode", "RemoveNodeRequest", "Empty"))
        .method(unary("transfer_leader", "TransferLeader", "TransferLeaderRequest", "TransferLeaderResponse"))
        .method(unary("info", "Info", "Empty", "InfoResponse"))
        .method(unary("shard_group_get", "ShardGroupGet", "Empty", "ShardGroupMessage"))
        .method(unary("shard_group_add", "ShardGroupAdd", "ShardGroupMessage", "Empty"))
        .method(unary("shard_group_update", "ShardGroupUpdate", "ShardGroupMessage", "Empty"))
        .method(unary("shard_group_link", "ShardGroupLink", "ShardGroupLinkRequest", "Empty"))
        .method(unary("config_get", "ConfigGet", "ConfigGetRequest", "ConfigGetResponse"))
        .method(unary("config_set", "ConfigSet", "ConfigSetRequest", "Empty"))
        .method(unary("debug_compact", "DebugCompact", "DebugCompactRequest", "DebugCompactResponse"))
        .method(unary("debug_send_snapshot", "DebugSendSnapshot", "DebugSendSnapshotRequest", "Empty"))
        .method(unary("debug_used_node_ids", "DebugUsedNodeIds", "Empty", "UsedNodeIdsResponse"))
        .build();

    Builder::new().compile(&[raft_service, admin_service]);
}

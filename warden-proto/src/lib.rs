//! Warden Protocol - Protobuf types for agent-server and admin communication

/// Shared message types.
pub mod types {
    pub mod v1 {
        tonic::include_proto!("warden.types.v1");
    }
}

/// Agent-facing node API.
pub mod node {
    pub mod v1 {
        tonic::include_proto!("warden.node.v1");
    }
}

/// Admin-facing registration API.
pub mod registration {
    pub mod v1 {
        tonic::include_proto!("warden.registration.v1");
    }
}

/// File descriptor set for gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("warden_descriptor");

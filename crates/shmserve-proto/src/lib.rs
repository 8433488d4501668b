pub mod shmserve {
    pub mod v1 {
        tonic::include_proto!("shmserve.v1");
    }
}

/// Encoded descriptors of the serving protocol, for gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("shmserve_descriptor");

//! Wire messages and the `pb.Raft` service, generated from
//! `proto/raft.proto`.

tonic::include_proto!("pb");

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_raft_context_decodes() {
        let rc = RaftContext {
            id: 3,
            group: 1,
            addr: "10.0.0.3:7080".to_string(),
        };
        let decoded = RaftContext::decode(rc.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, rc);
        assert!(RaftContext::decode(&[0xff_u8, 0xff][..]).is_err());
    }
}

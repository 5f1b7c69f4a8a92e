mod common;

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use blockshare::error::RequestError;
    use blockshare::index::{Availability, MemoryIndex, PulledFileState};
    use blockshare::protocol::{
        BlockRequest, ClusterConfig, ConfigOption, Features, Index, IndexFlags, RequestFlags,
        FEATURES_KEY,
    };
    use blockshare::storage::{temp_name, FsStorage};
    use blockshare::{ConnectionState, FileInfo, Model};
    use tempfile::TempDir;

    use crate::common::*;

    fn temporary(folder: &str, files: Vec<FileInfo>) -> Index {
        Index {
            folder: folder.into(),
            flags: IndexFlags::TEMPORARY,
            files,
        }
    }

    fn peer_config(features: Features) -> ClusterConfig {
        ClusterConfig {
            client_name: "blockshare".into(),
            client_version: "v0.1.0".into(),
            options: vec![ConfigOption {
                key: FEATURES_KEY.into(),
                value: features.marshal(),
            }],
        }
    }

    #[test]
    fn test_model_temp_index() {
        let d1 = dev(1);
        let d2 = dev(2);
        let cfg = config(dev(0xAA), &[d1, d2], &[("x", Path::new("/unused"), &[d1, d2])]);
        let m = Model::new(
            dev(0xAA),
            cfg,
            Arc::new(MemoryIndex::new()),
            Arc::new(FsStorage::default()),
        );

        m.add_connection(FakeConnection::new(d1));
        m.add_connection(FakeConnection::new(d2));

        let files = files();
        let b = blocks();

        m.index_update(d1, temporary("x", files.clone()));
        for (name, block) in [("file1", b[0]), ("file2", b[4]), ("file3", b[6])] {
            let devs = m.availability("x", name, &block.hash);
            assert_eq!(devs.len(), 1, "{}", name);
            assert_eq!(devs[&d1], Availability::Temporary);
        }

        m.index_update(d2, temporary("x", files.clone()));
        for (name, block) in [("file1", b[0]), ("file2", b[4]), ("file3", b[6])] {
            let devs = m.availability("x", name, &block.hash);
            assert_eq!(devs.len(), 2, "{}", name);
            assert_eq!(devs[&d1], Availability::Temporary);
            assert_eq!(devs[&d2], Availability::Temporary);
        }

        // A new temporary index replaces the old one
        m.index_update(d1, temporary("x", files[1..].to_vec()));
        let devs = m.availability("x", "file1", &b[0].hash);
        assert_eq!(devs.len(), 1);
        assert_eq!(devs[&d2], Availability::Temporary);
        assert_eq!(m.availability("x", "file2", &b[4].hash).len(), 2);
        assert_eq!(m.availability("x", "file3", &b[6].hash).len(), 2);

        m.close(d2, "closed");
        assert!(m.availability("x", "file1", &b[0].hash).is_empty());
        let devs = m.availability("x", "file2", &b[4].hash);
        assert_eq!(devs.len(), 1);
        assert_eq!(devs[&d1], Availability::Temporary);
        let devs = m.availability("x", "file3", &b[6].hash);
        assert_eq!(devs.len(), 1);
        assert_eq!(devs[&d1], Availability::Temporary);
    }

    #[test]
    fn test_durable_wins_over_temporary() {
        let d1 = dev(1);
        let cfg = config(dev(0xAA), &[d1], &[("x", Path::new("/unused"), &[d1])]);
        let m = Model::new(
            dev(0xAA),
            cfg,
            Arc::new(MemoryIndex::new()),
            Arc::new(FsStorage::default()),
        );
        m.add_connection(FakeConnection::new(d1));

        let files = files();
        let b = blocks();
        m.index_update(d1, temporary("x", files.clone()));
        m.index_update(
            d1,
            Index {
                folder: "x".into(),
                flags: IndexFlags::empty(),
                files: files[..1].to_vec(),
            },
        );

        let devs = m.availability("x", "file1", &b[0].hash);
        assert_eq!(devs[&d1], Availability::Durable);
        let devs = m.availability("x", "file2", &b[3].hash);
        assert_eq!(devs[&d1], Availability::Temporary);
    }

    #[test]
    fn test_index_from_unshared_or_unconnected_is_dropped() {
        let d1 = dev(1);
        let d2 = dev(2);
        let cfg = config(dev(0xAA), &[d1, d2], &[("x", Path::new("/unused"), &[d1, d2])]);
        let m = Model::new(
            dev(0xAA),
            cfg,
            Arc::new(MemoryIndex::new()),
            Arc::new(FsStorage::default()),
        );
        m.add_connection(FakeConnection::new(d1));

        let b = blocks();
        m.index_update(d1, temporary("y", files()));
        m.index_update(d2, temporary("x", files()));
        assert!(m.availability("x", "file1", &b[0].hash).is_empty());
        assert!(m.availability("y", "file1", &b[0].hash).is_empty());
    }

    #[tokio::test]
    async fn test_request_temp_index() -> anyhow::Result<()> {
        let root = TempDir::new()?;
        let d1 = dev(1);
        let cfg = config(
            dev(0xAA),
            &[d1],
            &[("x", root.path(), &[d1]), ("y", root.path(), &[])],
        );
        let m = Model::new(
            dev(0xAA),
            cfg.clone(),
            Arc::new(MemoryIndex::new()),
            Arc::new(FsStorage::new(cfg.get().folder_roots())),
        );

        let b = blocks();
        let staging = temp_name("file");
        std::fs::write(root.path().join(&staging), all_block_data())?;

        let pulled = FileInfo {
            name: "file".into(),
            version: 1,
            blocks: b[1..].to_vec(),
        };
        let state = Arc::new(
            PulledFileState::new("x", pulled.clone(), staging.clone())
                .with_available([&b[2], &b[3], &b[4], &b[7]]),
        );
        m.progress().register(state.clone());
        // Part of a folder not shared with the device
        m.progress().register(Arc::new(
            PulledFileState::new("y", pulled, staging).with_available([&b[2], &b[3], &b[4], &b[7]]),
        ));
        assert_eq!(m.progress().temporary_index("x").len(), 1);
        assert_eq!(m.progress().temporary_index("y").len(), 1);

        let fc = FakeConnection::new(d1);
        m.add_connection(fc.clone());
        assert_eq!(m.connection_state(&d1), ConnectionState::NegotiatingFeatures);
        {
            let sent = fc.cluster_configs.lock();
            assert_eq!(sent.len(), 1);
            assert_eq!(
                sent[0].get_option(FEATURES_KEY),
                Some(Features::TEMPORARY_INDEX.marshal().as_str())
            );
        }

        m.cluster_config(d1, peer_config(Features::TEMPORARY_INDEX));
        assert_eq!(m.connection_state(&d1), ConnectionState::Active);
        assert!(m.features(&d1).contains(Features::TEMPORARY_INDEX));

        let blk = {
            let indexes = fc.indexes.lock();
            assert_eq!(indexes.len(), 2);
            assert!(!indexes[0].is_temporary());
            assert!(indexes[1].is_temporary());
            assert_eq!(indexes[1].folder, "x");
            assert_eq!(indexes[1].files.len(), 1);
            assert_eq!(indexes[1].files[0].blocks, vec![b[2], b[3], b[4], b[7]]);
            indexes[1].files[0].blocks[0]
        };

        let req = BlockRequest::for_block("x", "file", &blk, RequestFlags::TEMPORARY);
        let data = m.request(d1, &req).await?;
        assert!(blk.verify(&data));

        m.progress().deregister(&state);
        assert!(matches!(
            m.request(d1, &req).await,
            Err(RequestError::Invalid)
        ));

        let req = BlockRequest::for_block("y", "file", &blk, RequestFlags::TEMPORARY);
        assert!(matches!(
            m.request(d1, &req).await,
            Err(RequestError::NoSuchFile)
        ));
        Ok(())
    }

    #[test]
    fn test_no_temp_index_without_feature() {
        let d1 = dev(1);
        let cfg = config(dev(0xAA), &[d1], &[("x", Path::new("/unused"), &[d1])]);
        let m = Model::new(
            dev(0xAA),
            cfg,
            Arc::new(MemoryIndex::new()),
            Arc::new(FsStorage::default()),
        );
        let b = blocks();
        m.progress().register(Arc::new(
            PulledFileState::new("x", files()[0].clone(), temp_name("file1"))
                .with_available([&b[0]]),
        ));

        let fc = FakeConnection::new(d1);
        m.add_connection(fc.clone());
        m.cluster_config(d1, peer_config(Features::empty()));
        assert_eq!(m.connection_state(&d1), ConnectionState::Active);
        {
            let indexes = fc.indexes.lock();
            assert_eq!(indexes.len(), 1);
            assert!(!indexes[0].is_temporary());
        }

        // Features are settled for the life of the connection
        m.cluster_config(d1, peer_config(Features::TEMPORARY_INDEX));
        assert_eq!(fc.indexes.lock().len(), 1);
        assert!(m.features(&d1).is_empty());
    }

    #[test]
    fn test_unparseable_features_mean_none() {
        let d1 = dev(1);
        let cfg = config(dev(0xAA), &[d1], &[("x", Path::new("/unused"), &[d1])]);
        let m = Model::new(
            dev(0xAA),
            cfg,
            Arc::new(MemoryIndex::new()),
            Arc::new(FsStorage::default()),
        );
        let fc = FakeConnection::new(d1);
        m.add_connection(fc.clone());

        let mut config = peer_config(Features::empty());
        config.options[0].value = "2:00000001".into();
        m.cluster_config(d1, config);
        assert!(m.features(&d1).is_empty());
        assert_eq!(fc.indexes.lock().len(), 1);
    }
}

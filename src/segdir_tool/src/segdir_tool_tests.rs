use super::parse_args_from;
use crate::segdir_tool::{execute, run_segdir_tool, ToolCommand, ToolOptions};
use segdir_mgr::{SegStoreConfig, SegStoreMgr};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn write_test_config(tmp: &TempDir, local_dir: &str) -> PathBuf {
    let config_path = tmp.path().join(format!("segdir_{}.json", local_dir));
    let config_json = serde_json::json!({
        "base_coord_path": "/segdir",
        "local_paths": [tmp.path().join(local_dir)],
        "block_size": "4k",
        "remote": { "type": "fs", "base_path": tmp.path().join("remote") },
        "coord": { "type": "sqlite", "db_path": tmp.path().join("coord").join("coord.db") }
    });
    std::fs::write(
        &config_path,
        serde_json::to_string_pretty(&config_json).expect("serialize config"),
    )
    .expect("write config");
    config_path
}

fn run(config: &Path, command: ToolCommand) {
    run_segdir_tool(ToolOptions {
        config_path: config.to_path_buf(),
        command,
    })
    .expect("run segdir_tool");
}

#[test]
fn test_parse_args() {
    let options = parse_args_from(args(&["--config", "/tmp/s.json", "create-dir", "c1", "d1"]))
        .expect("parse create-dir");
    assert_eq!(options.config_path, PathBuf::from("/tmp/s.json"));
    assert_eq!(
        options.command,
        ToolCommand::CreateDir {
            cluster: "c1".to_string(),
            dir: "d1".to_string()
        }
    );

    let options = parse_args_from(args(&["put", "c1", "d1", "/data/_0.cfs"])).expect("parse put");
    assert_eq!(
        options.config_path,
        PathBuf::from(segdir_mgr::DEFAULT_SEGDIR_CONFIG_PATH)
    );
    assert_eq!(
        options.command,
        ToolCommand::Put {
            cluster: "c1".to_string(),
            dir: "d1".to_string(),
            file: PathBuf::from("/data/_0.cfs"),
            name: "_0.cfs".to_string(),
        }
    );
}

#[test]
fn test_parse_args_errors() {
    assert!(parse_args_from(Vec::new()).unwrap_err().contains("usage"));
    assert!(parse_args_from(args(&["--help"])).is_err());
    assert!(parse_args_from(args(&["--config"]))
        .unwrap_err()
        .contains("missing value"));
    assert!(parse_args_from(args(&["--verbose", "clusters"]))
        .unwrap_err()
        .contains("unknown argument"));
    assert!(parse_args_from(args(&["dirs"]))
        .unwrap_err()
        .contains("missing <cluster>"));
    assert!(parse_args_from(args(&["clusters", "extra"]))
        .unwrap_err()
        .contains("unexpected argument"));
    assert!(parse_args_from(args(&["frobnicate"]))
        .unwrap_err()
        .contains("unknown command"));
}

#[test]
fn test_put_then_get_from_another_host() {
    let tmp = TempDir::new().expect("create temp dir");
    let config_a = write_test_config(&tmp, "host_a");
    let config_b = write_test_config(&tmp, "host_b");

    let input = tmp.path().join("input.bin");
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 241) as u8).collect();
    std::fs::write(&input, &payload).expect("write input");

    run(
        &config_a,
        ToolCommand::CreateDir {
            cluster: "c1".to_string(),
            dir: "d1".to_string(),
        },
    );
    run(
        &config_a,
        ToolCommand::Put {
            cluster: "c1".to_string(),
            dir: "d1".to_string(),
            file: input.clone(),
            name: "blob".to_string(),
        },
    );
    assert!(tmp.path().join("remote/c1/d1/blob").exists());

    let output = tmp.path().join("output.bin");
    run(
        &config_b,
        ToolCommand::Get {
            cluster: "c1".to_string(),
            dir: "d1".to_string(),
            name: "blob".to_string(),
            out: output.clone(),
        },
    );
    assert_eq!(std::fs::read(&output).expect("read output"), payload);
}

#[tokio::test]
async fn test_execute_listing_and_removal() {
    let tmp = TempDir::new().expect("create temp dir");
    let config_path = write_test_config(&tmp, "host_a");
    let config = SegStoreConfig::load_from_file(&config_path).expect("load config");
    let mgr = SegStoreMgr::from_config(config).await.expect("create mgr");

    let create = ToolCommand::CreateDir {
        cluster: "c1".to_string(),
        dir: "d1".to_string(),
    };
    execute(&mgr, &create).await.expect("create-dir");
    assert_eq!(
        execute(&mgr, &ToolCommand::Clusters).await.expect("clusters"),
        vec!["c1".to_string()]
    );

    let input = tmp.path().join("seg");
    std::fs::write(&input, b"0123456789").expect("write input");
    let put = ToolCommand::Put {
        cluster: "c1".to_string(),
        dir: "d1".to_string(),
        file: input,
        name: "seg".to_string(),
    };
    execute(&mgr, &put).await.expect("put");

    let ls = ToolCommand::Ls {
        cluster: "c1".to_string(),
        dir: "d1".to_string(),
    };
    assert_eq!(
        execute(&mgr, &ls).await.expect("ls"),
        vec!["seg\t10".to_string()]
    );

    let get_missing = ToolCommand::Get {
        cluster: "c1".to_string(),
        dir: "d1".to_string(),
        name: "nope".to_string(),
        out: tmp.path().join("nope"),
    };
    assert!(execute(&mgr, &get_missing)
        .await
        .unwrap_err()
        .is_not_found());

    execute(
        &mgr,
        &ToolCommand::RemoveCluster {
            cluster: "c1".to_string(),
        },
    )
    .await
    .expect("remove-cluster");
    assert!(execute(&mgr, &ToolCommand::Clusters)
        .await
        .expect("clusters")
        .is_empty());
    assert!(!tmp.path().join("remote/c1/d1").exists());
    mgr.close().await.expect("close mgr");
}

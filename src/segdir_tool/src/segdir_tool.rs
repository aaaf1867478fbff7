use log::info;
use segdir_lib::{read_file, write_file, SegDirectory, SegError, SegResult};
use segdir_mgr::{SegStoreConfig, SegStoreMgr};
use std::path::PathBuf;
use tokio::runtime::Runtime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCommand {
    Clusters,
    CreateCluster {
        cluster: String,
    },
    RemoveCluster {
        cluster: String,
    },
    Dirs {
        cluster: String,
    },
    CreateDir {
        cluster: String,
        dir: String,
    },
    RemoveDir {
        cluster: String,
        dir: String,
    },
    Ls {
        cluster: String,
        dir: String,
    },
    Put {
        cluster: String,
        dir: String,
        file: PathBuf,
        name: String,
    },
    Get {
        cluster: String,
        dir: String,
        name: String,
        out: PathBuf,
    },
}

impl ToolCommand {
    pub fn parse(args: &[String]) -> Result<Self, String> {
        let (command, rest) = args
            .split_first()
            .ok_or_else(|| "missing command".to_string())?;
        let arg = |i: usize, what: &str| -> Result<String, String> {
            rest.get(i)
                .cloned()
                .ok_or_else(|| format!("{}: missing <{}>", command, what))
        };
        let max_args = |n: usize| -> Result<(), String> {
            if rest.len() > n {
                return Err(format!("{}: unexpected argument {}", command, rest[n]));
            }
            Ok(())
        };

        let parsed = match command.as_str() {
            "clusters" => {
                max_args(0)?;
                ToolCommand::Clusters
            }
            "create-cluster" => {
                max_args(1)?;
                ToolCommand::CreateCluster {
                    cluster: arg(0, "cluster")?,
                }
            }
            "remove-cluster" => {
                max_args(1)?;
                ToolCommand::RemoveCluster {
                    cluster: arg(0, "cluster")?,
                }
            }
            "dirs" => {
                max_args(1)?;
                ToolCommand::Dirs {
                    cluster: arg(0, "cluster")?,
                }
            }
            "create-dir" => {
                max_args(2)?;
                ToolCommand::CreateDir {
                    cluster: arg(0, "cluster")?,
                    dir: arg(1, "dir")?,
                }
            }
            "remove-dir" => {
                max_args(2)?;
                ToolCommand::RemoveDir {
                    cluster: arg(0, "cluster")?,
                    dir: arg(1, "dir")?,
                }
            }
            "ls" => {
                max_args(2)?;
                ToolCommand::Ls {
                    cluster: arg(0, "cluster")?,
                    dir: arg(1, "dir")?,
                }
            }
            "put" => {
                max_args(4)?;
                let file = PathBuf::from(arg(2, "local-file")?);
                let name = match rest.get(3) {
                    Some(name) => name.clone(),
                    None => file
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .ok_or_else(|| format!("put: cannot derive a name from {}", file.display()))?,
                };
                ToolCommand::Put {
                    cluster: arg(0, "cluster")?,
                    dir: arg(1, "dir")?,
                    file,
                    name,
                }
            }
            "get" => {
                max_args(4)?;
                ToolCommand::Get {
                    cluster: arg(0, "cluster")?,
                    dir: arg(1, "dir")?,
                    name: arg(2, "name")?,
                    out: PathBuf::from(arg(3, "out-file")?),
                }
            }
            other => return Err(format!("unknown command: {}", other)),
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone)]
pub struct ToolOptions {
    pub config_path: PathBuf,
    pub command: ToolCommand,
}

/// Runs one command and returns the lines to print.
pub async fn execute(mgr: &SegStoreMgr, command: &ToolCommand) -> SegResult<Vec<String>> {
    let lines = match command {
        ToolCommand::Clusters => mgr.list_clusters().await?,
        ToolCommand::CreateCluster { cluster } => {
            mgr.create_cluster(cluster).await?;
            vec![format!("cluster {} ready", cluster)]
        }
        ToolCommand::RemoveCluster { cluster } => {
            mgr.remove_cluster(cluster).await?;
            vec![format!("cluster {} removed", cluster)]
        }
        ToolCommand::Dirs { cluster } => mgr.list_directories(cluster).await?,
        ToolCommand::CreateDir { cluster, dir } => {
            mgr.create_directory(cluster, dir).await?;
            vec![format!("directory {}/{} ready", cluster, dir)]
        }
        ToolCommand::RemoveDir { cluster, dir } => {
            mgr.remove_directory(cluster, dir).await?;
            vec![format!("directory {}/{} removed", cluster, dir)]
        }
        ToolCommand::Ls { cluster, dir } => {
            let replicated = mgr.open_replicated(cluster, dir, false).await?;
            let mut lines = Vec::new();
            for name in replicated.list_all().await? {
                let length = replicated.remote().file_length(&name).await?;
                lines.push(format!("{}\t{}", name, length));
            }
            lines
        }
        ToolCommand::Put {
            cluster,
            dir,
            file,
            name,
        } => {
            let data = tokio::fs::read(file).await.map_err(|e| {
                SegError::IoError(format!("read {} failed: {}", file.display(), e))
            })?;
            let replicated = mgr.open_replicated(cluster, dir, true).await?;
            write_file(&replicated, name, &data).await?;
            replicated.sync(name).await?;
            info!("segdir_tool: put {} into {}/{}", name, cluster, dir);
            vec![format!("{}\t{}", name, data.len())]
        }
        ToolCommand::Get {
            cluster,
            dir,
            name,
            out,
        } => {
            let replicated = mgr.open_replicated(cluster, dir, false).await?;
            if !replicated.file_exists(name).await? {
                return Err(SegError::NotFound(format!(
                    "{} in {}/{}",
                    name, cluster, dir
                )));
            }
            let data = read_file(&replicated, name).await?;
            tokio::fs::write(out, &data).await.map_err(|e| {
                SegError::IoError(format!("write {} failed: {}", out.display(), e))
            })?;
            vec![format!("{}\t{}", name, data.len())]
        }
    };
    Ok(lines)
}

pub fn run_segdir_tool(options: ToolOptions) -> SegResult<()> {
    let runtime = Runtime::new().map_err(|e| SegError::Internal(e.to_string()))?;
    let lines = runtime.block_on(async {
        let config = SegStoreConfig::load_from_file(&options.config_path)?;
        let mgr = SegStoreMgr::from_config(config).await?;
        let result = execute(&mgr, &options.command).await;
        let closed = mgr.close().await;
        let lines = result?;
        closed?;
        Ok::<_, SegError>(lines)
    })?;
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use autoreduce_core::{config::PathsConfig, JobMessage, LogLocations, PathTranslator};
use tempfile::TempDir;
use tracing::debug;

/// 一次执行所需的全部路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    pub data_file: PathBuf,
    pub script_file: PathBuf,
    pub variables_file: PathBuf,
    pub staging_dir: PathBuf,
    pub final_dir: PathBuf,
}

impl RunPaths {
    pub fn log_dir(&self) -> PathBuf {
        self.final_dir.join("reduction_log")
    }

    pub fn log_locations(&self, job: &JobMessage) -> LogLocations {
        let stem = format!("RB_{}_Run_{}_Script", job.experiment_id, job.run_number);
        let log_dir = self.log_dir();
        LogLocations {
            out_log: log_dir.join(format!("{stem}.out")),
            err_log: log_dir.join(format!("{stem}.err")),
        }
    }
}

/// 输出目录布局
#[derive(Debug, Clone)]
pub struct OutputLayout {
    paths: PathsConfig,
}

impl OutputLayout {
    pub fn new(paths: PathsConfig) -> Self {
        Self { paths }
    }

    /// `{root}/{instrument}/RB{experiment}/autoreduced/{run}` 之下的版本目录;
    /// 平铺输出的仪器直接写入 `autoreduced`
    pub fn final_directory(&self, job: &JobMessage) -> PathBuf {
        let autoreduced = Path::new(&self.paths.output_root)
            .join(&job.instrument)
            .join(format!("RB{}", job.experiment_id))
            .join("autoreduced");

        if self.paths.is_flat_output(&job.instrument) {
            return autoreduced;
        }

        let run_dir = autoreduced.join(job.run_number.to_string());
        let version = if job.overwrite {
            0
        } else {
            next_run_version(&run_dir)
        };
        run_dir.join(format!("run-version-{version}"))
    }
}

fn next_run_version(run_dir: &Path) -> u32 {
    let Ok(entries) = fs::read_dir(run_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("run-version-"))
                .and_then(|v| v.parse::<u32>().ok())
        })
        .max()
        .map_or(0, |v| v + 1)
}

/// 运行工作区: 临时暂存目录和脚本/变量文件, 析构时删除
pub struct RunWorkspace {
    paths: RunPaths,
    _staging: TempDir,
    _inputs: TempDir,
}

impl RunWorkspace {
    /// 写出脚本与变量文件, 创建暂存目录和最终输出目录
    pub fn prepare(
        job: &JobMessage,
        layout: &OutputLayout,
        translator: &PathTranslator,
    ) -> io::Result<Self> {
        let inputs = tempfile::Builder::new().prefix("autoreduce-input-").tempdir()?;
        let staging = tempfile::Builder::new().prefix("autoreduce-staging-").tempdir()?;

        let script_file = inputs.path().join("reduce.py");
        fs::write(&script_file, &job.script_text)?;

        let variables_file = inputs.path().join("reduce_vars.json");
        let variables = serde_json::json!({
            "standard_vars": job.standard_vars,
            "advanced_vars": job.advanced_vars,
        });
        fs::write(&variables_file, serde_json::to_vec_pretty(&variables)?)?;

        let final_dir = layout.final_directory(job);
        fs::create_dir_all(&final_dir)?;

        let paths = RunPaths {
            data_file: PathBuf::from(translator.translate(&job.data_path)),
            script_file,
            variables_file,
            staging_dir: staging.path().to_path_buf(),
            final_dir,
        };
        debug!("准备运行工作区: {:?}", paths);

        Ok(Self {
            paths,
            _staging: staging,
            _inputs: inputs,
        })
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }
}

/// 递归复制目录内容, 覆盖已存在的文件
pub fn copy_tree(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(instrument: &str, overwrite: bool) -> JobMessage {
        serde_json::from_value(serde_json::json!({
            "run_number": 1234,
            "experiment_id": 1910232,
            "instrument": instrument,
            "data_path": r"\\isis\inst$\NDXPOLARIS\data\POL1234.nxs",
            "script_text": "print('reducing')",
            "standard_vars": {"mode": "PDF"},
            "overwrite": overwrite
        }))
        .unwrap()
    }

    fn layout(root: &Path) -> OutputLayout {
        OutputLayout::new(PathsConfig {
            output_root: root.to_string_lossy().into_owned(),
            ..PathsConfig::default()
        })
    }

    #[test]
    fn test_versioned_output_directory() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        let base = root.path().join("POLARIS/RB1910232/autoreduced/1234");

        assert_eq!(
            layout.final_directory(&job("POLARIS", false)),
            base.join("run-version-0")
        );

        fs::create_dir_all(base.join("run-version-0")).unwrap();
        fs::create_dir_all(base.join("run-version-3")).unwrap();
        fs::create_dir_all(base.join("not-a-version")).unwrap();
        assert_eq!(
            layout.final_directory(&job("POLARIS", false)),
            base.join("run-version-4")
        );
        assert_eq!(
            layout.final_directory(&job("POLARIS", true)),
            base.join("run-version-0")
        );
    }

    #[test]
    fn test_flat_output_instrument() {
        let root = tempfile::tempdir().unwrap();
        let layout = layout(root.path());
        assert_eq!(
            layout.final_directory(&job("MARI", false)),
            root.path().join("MARI/RB1910232/autoreduced")
        );
    }

    #[test]
    fn test_prepare_writes_inputs() {
        let root = tempfile::tempdir().unwrap();
        let job = job("POLARIS", false);
        let workspace =
            RunWorkspace::prepare(&job, &layout(root.path()), &PathTranslator::default()).unwrap();
        let paths = workspace.paths().clone();

        assert_eq!(paths.data_file, PathBuf::from("/isis/NDXPOLARIS/data/POL1234.nxs"));
        assert_eq!(fs::read_to_string(&paths.script_file).unwrap(), "print('reducing')");
        let vars: serde_json::Value =
            serde_json::from_slice(&fs::read(&paths.variables_file).unwrap()).unwrap();
        assert_eq!(vars["standard_vars"]["mode"], "PDF");
        assert!(paths.staging_dir.is_dir());
        assert!(paths.final_dir.is_dir());
        assert!(paths
            .log_locations(&job)
            .out_log
            .ends_with("reduction_log/RB_1910232_Run_1234_Script.out"));

        drop(workspace);
        assert!(!paths.staging_dir.exists());
        assert!(!paths.script_file.exists());
        assert!(paths.final_dir.is_dir());
    }

    #[test]
    fn test_copy_tree_recurses() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("nested")).unwrap();
        fs::write(source.path().join("a.nxs"), b"a").unwrap();
        fs::write(source.path().join("nested/b.txt"), b"b").unwrap();

        copy_tree(source.path(), destination.path()).unwrap();
        assert_eq!(fs::read(destination.path().join("a.nxs")).unwrap(), b"a");
        assert_eq!(fs::read(destination.path().join("nested/b.txt")).unwrap(), b"b");
    }
}

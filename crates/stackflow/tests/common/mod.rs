use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const CLUSTER_STACK: &str = r#"
stack "shop" {
    environment "dev"
    location "westeurope"
    resource-group "shop-rg"
    registry "shopacr01"
    cluster "shop-aks" {
        credentials "admin"
    }
}
"#;

pub const APP_SERVICE_STACK: &str = r#"
stack "shopweb" {
    platform "app-service"
    resource-group "shopweb-rg"
    registry "shopwebacr01"
}
"#;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn write_stack_kdl(&self, content: &str) {
        fs::write(self.root.path().join("stack.kdl"), content).unwrap();
    }

    #[allow(dead_code)]
    pub fn write_state(&self, content: &str) {
        let dir = self.root.path().join(".stackflow");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("state.json"), content).unwrap();
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    /// Command rooted in the project with no global config or env override
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("stackflow").unwrap();
        cmd.current_dir(self.path())
            .env_remove("STACKFLOW_CONFIG_PATH")
            .env_remove("STACKFLOW_CONCURRENCY")
            .env_remove("LOCATION")
            .env_remove("NODE_SIZE")
            .env("XDG_CONFIG_HOME", self.path().join("xdg"))
            .env("NO_COLOR", "1");
        cmd
    }
}

#![allow(dead_code)]

use media_station::{
    api::{build_router, AppState},
    config::Config,
};
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Copies the `-i` argument to the last argument, like a lossless ffmpeg.
pub const COPY_SCRIPT: &str = r#"while [ $# -gt 1 ]; do
  if [ "$1" = "-i" ]; then in="$2"; fi
  shift
done
cp "$in" "$1""#;

pub const FAIL_SCRIPT: &str = "echo 'moov atom not found' >&2\nexit 1";

#[cfg(unix)]
pub fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub server: JoinHandle<()>,
    pub tmp: tempfile::TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Spawn a server on an ephemeral port; `tweak` adjusts the config rooted at
/// a fresh temp dir.
pub async fn spawn_server<F>(tweak: F) -> TestServer
where
    F: FnOnce(&mut Config, &Path),
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::with_data_dir(tmp.path().join("data"));
    config.bind = addr.to_string();
    tweak(&mut config, tmp.path());
    let state = AppState::new(config, CancellationToken::new()).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        addr,
        state,
        server,
        tmp,
    }
}

pub fn file_part(name: &str, mime: &str, data: &[u8]) -> reqwest::multipart::Form {
    reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(name.to_string())
            .mime_str(mime)
            .unwrap(),
    )
}

pub fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

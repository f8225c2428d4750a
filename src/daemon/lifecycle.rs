//! 데몬 프로세스 단위의 상태: 소켓 경로와 PID 마커
//!
//! 규칙:
//! - 시작할 때 PID 마커를 배타적으로 생성한 프로세스만 소켓을 바인드한다.
//! - 마커의 프로세스가 살아 있지 않으면 오래된 것으로 보고 소켓과 함께 지운다.
//! - 종료할 때는 소켓과 마커를 함께 지운다.

use crate::config::Config;
use crate::error::{KosError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SOCKET_FILE: &str = "kos-bridge.sock";
const PID_FILE: &str = "kos-bridge.pid";
const LOG_FILE: &str = "daemon.log";

/// 빈 마커를 다른 프로세스가 아직 쓰는 중으로 보는 시간
const CLAIM_GRACE: Duration = Duration::from_secs(2);

/// 데몬 런타임 파일 위치
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub pid: PathBuf,
    pub log: PathBuf,
}

/// PID 마커로 판단한 데몬 생존 여부
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    NotRunning,
    Running(u32),
    /// 마커는 있지만 프로세스가 없음
    Stale(Option<u32>),
}

impl DaemonPaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            socket: dir.join(SOCKET_FILE),
            pid: dir.join(PID_FILE),
            log: dir.join(LOG_FILE),
            dir,
        }
    }

    /// 설정 → XDG_RUNTIME_DIR → 임시 디렉토리 순
    pub fn from_config(config: &Config) -> Self {
        let dir = config
            .runtime_dir
            .clone()
            .or_else(dirs::runtime_dir)
            .unwrap_or_else(std::env::temp_dir);
        Self::in_dir(dir)
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn liveness(&self) -> Liveness {
        if !self.pid.exists() {
            return Liveness::NotRunning;
        }
        match self.read_pid() {
            Some(pid) if process_alive(pid) => Liveness::Running(pid),
            pid => Liveness::Stale(pid),
        }
    }

    /// 오래된 소켓과 마커 제거
    pub fn clear_stale(&self) -> Result<()> {
        remove_if_exists(&self.socket)?;
        remove_if_exists(&self.pid)?;
        Ok(())
    }
}

/// 이 프로세스가 소유한 PID 마커
///
/// `release()` 또는 drop 시 소켓과 마커를 함께 지웁니다.
#[derive(Debug)]
pub struct PidGuard {
    paths: DaemonPaths,
    pid: u32,
    released: bool,
}

impl PidGuard {
    /// 마커 획득 시도
    ///
    /// 살아 있는 다른 데몬이 있으면 `Ok(None)`.
    pub fn claim(paths: &DaemonPaths) -> Result<Option<Self>> {
        fs::create_dir_all(&paths.dir)?;
        let pid = std::process::id();

        // 오래된 마커를 지운 뒤 한 번 더 시도
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&paths.pid) {
                Ok(mut file) => {
                    file.write_all(pid.to_string().as_bytes())?;
                    file.sync_all()?;
                    debug!("Claimed PID marker {}", paths.pid.display());
                    return Ok(Some(Self {
                        paths: paths.clone(),
                        pid,
                        released: false,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match paths.liveness() {
                    Liveness::Running(owner) if owner != pid || socket_answers(&paths.socket) => {
                        info!("Daemon already running (pid {})", owner);
                        return Ok(None);
                    }
                    Liveness::Stale(None) if marker_is_fresh(&paths.pid) => {
                        // create_new와 PID 기록 사이의 다른 데몬
                        info!("Another daemon is claiming {}", paths.pid.display());
                        return Ok(None);
                    }
                    liveness => {
                        warn!("Removing stale daemon marker ({:?})", liveness);
                        paths.clear_stale()?;
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        Err(KosError::DaemonUnavailable(format!(
            "could not claim PID marker {}",
            paths.pid.display()
        )))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn paths(&self) -> &DaemonPaths {
        &self.paths
    }

    /// 소켓과 마커 삭제 (두 번 호출해도 안전)
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        remove_if_exists(&self.paths.socket)?;
        // 다른 프로세스가 이미 마커를 가져갔다면 건드리지 않음
        if self.paths.read_pid() == Some(self.pid) {
            remove_if_exists(&self.paths.pid)?;
        }
        Ok(())
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to remove daemon runtime files: {}", e);
        }
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// 방금 만들어져 아직 PID가 기록되지 않았을 수 있는 마커인지
pub fn marker_is_fresh(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|modified| {
            SystemTime::now()
                .duration_since(modified)
                .map_or(true, |age| age < CLAIM_GRACE)
        })
        .unwrap_or(false)
}

/// 소켓에 실제로 누군가 대기 중인지
pub fn socket_answers(socket: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(socket).is_ok()
}

/// 시그널 0으로 프로세스 존재 확인
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // SAFETY: 시그널 0은 전달되지 않고 권한/존재 여부만 검사함
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 이미 종료된 자식 프로세스의 PID
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_paths_layout() {
        let paths = DaemonPaths::in_dir("/tmp/kb-test");
        assert_eq!(paths.socket, PathBuf::from("/tmp/kb-test/kos-bridge.sock"));
        assert_eq!(paths.pid, PathBuf::from("/tmp/kb-test/kos-bridge.pid"));
        assert_eq!(paths.log, PathBuf::from("/tmp/kb-test/daemon.log"));
    }

    #[test]
    fn test_paths_from_config_runtime_dir() {
        let mut config = Config::default();
        config.runtime_dir = Some(PathBuf::from("/run/custom"));
        assert_eq!(DaemonPaths::from_config(&config).dir, PathBuf::from("/run/custom"));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(dead_pid()));
        assert!(!process_alive(0));
    }

    #[test]
    fn test_claim_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::in_dir(dir.path());

        let mut guard = PidGuard::claim(&paths).unwrap().expect("marker should be free");
        assert_eq!(paths.read_pid(), Some(std::process::id()));
        assert_eq!(paths.liveness(), Liveness::Running(std::process::id()));

        fs::write(&paths.socket, b"").unwrap();
        guard.release().unwrap();
        guard.release().unwrap();
        assert!(!paths.pid.exists());
        assert!(!paths.socket.exists());
        assert_eq!(paths.liveness(), Liveness::NotRunning);
    }

    #[test]
    fn test_claim_refused_while_other_process_alive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::in_dir(dir.path());

        // PID 1은 항상 살아 있음
        fs::write(&paths.pid, "1").unwrap();
        assert!(PidGuard::claim(&paths).unwrap().is_none());
        assert!(paths.pid.exists());
    }

    #[test]
    fn test_own_pid_without_socket_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::in_dir(dir.path());

        // 재부팅 등으로 PID가 재사용된 경우
        fs::write(&paths.pid, std::process::id().to_string()).unwrap();
        assert!(PidGuard::claim(&paths).unwrap().is_some());
    }

    #[test]
    fn test_fresh_empty_marker_is_claim_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::in_dir(dir.path());

        // 다른 프로세스가 create_new만 하고 PID는 아직 쓰지 않은 상태
        OpenOptions::new().write(true).create_new(true).open(&paths.pid).unwrap();
        assert_eq!(paths.liveness(), Liveness::Stale(None));

        assert!(PidGuard::claim(&paths).unwrap().is_none());
        assert!(paths.pid.exists());
        assert_eq!(fs::read_to_string(&paths.pid).unwrap(), "");
    }

    #[test]
    fn test_old_empty_marker_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::in_dir(dir.path());

        let file = OpenOptions::new().write(true).create_new(true).open(&paths.pid).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(60)).unwrap();
        drop(file);

        let guard = PidGuard::claim(&paths).unwrap().expect("abandoned marker should be reclaimed");
        assert_eq!(paths.read_pid(), Some(guard.pid()));
    }

    #[test]
    fn test_stale_marker_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::in_dir(dir.path());

        let dead = dead_pid();
        fs::write(&paths.pid, dead.to_string()).unwrap();
        fs::write(&paths.socket, b"").unwrap();
        assert_eq!(paths.liveness(), Liveness::Stale(Some(dead)));

        let guard = PidGuard::claim(&paths).unwrap().expect("stale marker should be reclaimed");
        assert_eq!(guard.pid(), std::process::id());
        assert!(!paths.socket.exists());
        drop(guard);
        assert!(!paths.pid.exists());
    }
}

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "kos-bridge")]
#[command(version)]
#[command(about = "Run commands on a kOS terminal through a persistent local daemon", long_about = None)]
pub struct Cli {
    /// 원격 터미널에서 실행할 명령 (여러 단어는 공백으로 이어 붙임)
    #[arg(required_unless_present_any = ["daemon_start", "daemon_stop", "daemon_status", "daemon_run", "init_config"])]
    pub command: Vec<String>,

    /// 원격 명령 시간 제한 (밀리초). 미지정시 설정값 사용
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// 데몬을 새로 띄울 때 선택할 CPU (번호 또는 이름표)
    #[arg(long)]
    pub cpu: Option<String>,

    /// 출력만 그대로 표시 (스피너, 상태 메시지 없음)
    #[arg(long)]
    pub raw: bool,

    /// 데몬 서버 시작
    #[arg(long)]
    pub daemon_start: bool,

    /// 데몬 서버 종료
    #[arg(long)]
    pub daemon_stop: bool,

    /// 데몬 서버 상태 확인
    #[arg(long)]
    pub daemon_status: bool,

    /// 데몬을 포그라운드에서 실행 (자동 기동에 사용)
    #[arg(long, hide = true)]
    pub daemon_run: bool,

    /// 기본 설정 파일 생성
    #[arg(long)]
    pub init_config: bool,
}

impl Cli {
    pub fn command_text(&self) -> String {
        self.command.join(" ")
    }
}

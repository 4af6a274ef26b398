//! 会话输出端
//!
//! get_data的sendto选项决定推送去向：发回客户端（缺省）、在服务端
//! 控制台记日志、或追加到按会话命名的日志文件。文件端在会话销毁时
//! 冲刷并关闭。

use crate::mdcommon::error::Result;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use tokio::sync::mpsc;
use tracing::{info, warn};

pub enum OutputSink {
    /// 经消息通道发回客户端
    Client(mpsc::Sender<String>),
    /// 在服务端控制台输出
    Console,
    /// 追加到会话日志文件
    LogFile(BufWriter<File>),
}

impl OutputSink {
    /// 根据sendto选项构造输出端
    ///
    /// "console" -> 控制台，"log" -> 会话日志文件，其他任意值 -> 客户端。
    pub fn for_sendto(
        sendto: Option<&str>,
        client_tx: &mpsc::Sender<String>,
        client_id: &str,
    ) -> Result<Self> {
        match sendto {
            Some("console") => Ok(OutputSink::Console),
            Some("log") => {
                create_dir_all("logs")?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(format!("logs/session_{client_id}.log"))?;
                Ok(OutputSink::LogFile(BufWriter::new(file)))
            }
            _ => Ok(OutputSink::Client(client_tx.clone())),
        }
    }

    pub async fn send(&mut self, line: String) {
        match self {
            OutputSink::Client(tx) => {
                if tx.send(line).await.is_err() {
                    // 客户端已断开，发送端随会话销毁
                }
            }
            OutputSink::Console => {
                info!(target: "client_out", "{}", line);
            }
            OutputSink::LogFile(writer) => {
                if let Err(e) = writeln!(writer, "{line}") {
                    warn!(target: "client_out", "写会话日志失败: {}", e);
                }
            }
        }
    }

    /// 冲刷文件端，会话销毁路径调用
    pub fn flush(&mut self) {
        if let OutputSink::LogFile(writer) = self {
            let _ = writer.flush();
        }
    }
}

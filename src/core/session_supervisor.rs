//! 会话监管：编排器级取消
//!
//! 持有根 CancellationToken；每个任务运行拿一个子 token，单独取消某次运行不影响其它运行，
//! 关闭编排器时取消根 token 则全部运行退出。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 编排器级生命周期管理：根取消令牌与活跃运行表
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    runs: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一次运行登记子 token
    pub fn register_run(&self, run_id: &str) -> CancellationToken {
        let token = self.cancel_token.child_token();
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(run_id.to_string(), token.clone());
        }
        token
    }

    /// 运行结束后移除（无论成功、失败还是取消）
    pub fn finish_run(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }

    /// 取消指定运行；不存在时返回 false
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let token = self.runs.lock().ok().and_then(|r| r.get(run_id).cloned());
        match token {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部运行（编排器关闭）
    pub fn cancel_all(&self) {
        self.cancel_token.cancel();
    }

    pub fn active_runs(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_single_run() {
        let sup = SessionSupervisor::new();
        let a = sup.register_run("a");
        let b = sup.register_run("b");
        assert!(sup.cancel_run("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        sup.finish_run("a");
        assert_eq!(sup.active_runs(), 1);
        assert!(!sup.cancel_run("a"));
    }

    #[test]
    fn test_cancel_all() {
        let sup = SessionSupervisor::new();
        let a = sup.register_run("a");
        sup.cancel_all();
        assert!(a.is_cancelled());
    }
}

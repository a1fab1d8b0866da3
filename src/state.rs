//! 연결 상태 머신
//!
//! ```text
//!  UNKNOWN ──handshake──▶ ESTABLISHED ──local close──▶ CLOSING_BY_HOST ──▶ CLOSED
//!                              │                                            ▲
//!                              └──peer FIN+ACK──▶ CLOSING_BY_PEER ──close───┘
//!
//!  (any) ──protocol/transport error──▶ INVALID   (absorbing)
//! ```
//!
//! 상태는 [`StateMachine`] 의 전이 메서드로만 바뀐다.

use std::fmt;

use crate::{Error, Result};

/// 연결 수명 주기 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// 생성 직후, 핸드쉐이크 전
    #[default]
    Unknown,

    /// 핸드쉐이크 완료, 데이터 전송 가능
    Established,

    /// 로컬이 FIN+ACK 를 보내고 ACK 를 받음, 상대 FIN+ACK 대기
    ClosingByHost,

    /// 상대가 FIN+ACK 를 보냄, 로컬 close() 대기
    ClosingByPeer,

    Closed,

    /// 복구 불가능한 에러 이후
    Invalid,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unknown => "UNKNOWN",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::ClosingByHost => "CLOSING_BY_HOST",
            ConnectionState::ClosingByPeer => "CLOSING_BY_PEER",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Invalid => "INVALID",
        };
        f.write_str(name)
    }
}

/// 상태 전이를 한 곳으로 모은 상태 머신
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_invalid(&self) -> bool {
        self.state == ConnectionState::Invalid
    }

    /// `op` 가 현재 상태에서 허용되는지 확인
    ///
    /// INVALID 상태는 항상 [`Error::ConnectionInvalid`] 로 거부한다.
    pub fn require(&self, op: &'static str, allowed: &[ConnectionState]) -> Result<()> {
        if self.is_invalid() {
            return Err(Error::ConnectionInvalid);
        }
        if !allowed.contains(&self.state) {
            return Err(Error::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    /// 핸드쉐이크 완료
    pub fn establish(&mut self) -> Result<()> {
        self.transition("establish", &[ConnectionState::Unknown], ConnectionState::Established)
    }

    /// 능동 종료: 로컬 FIN+ACK 에 대한 ACK 수신
    pub fn close_by_host(&mut self) -> Result<()> {
        self.transition(
            "close_by_host",
            &[ConnectionState::Established],
            ConnectionState::ClosingByHost,
        )
    }

    /// 수동 종료: 상대 FIN+ACK 관찰
    pub fn close_by_peer(&mut self) -> Result<()> {
        self.transition(
            "close_by_peer",
            &[ConnectionState::Established],
            ConnectionState::ClosingByPeer,
        )
    }

    /// 종료 절차 완료
    pub fn finish(&mut self) -> Result<()> {
        self.transition(
            "finish",
            &[ConnectionState::ClosingByHost, ConnectionState::ClosingByPeer],
            ConnectionState::Closed,
        )
    }

    /// 어떤 상태에서든 INVALID 로 (이미 INVALID 면 변화 없음)
    pub fn invalidate(&mut self) {
        self.state = ConnectionState::Invalid;
    }

    fn transition(
        &mut self,
        op: &'static str,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<()> {
        self.require(op, from)?;
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_close_path() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), ConnectionState::Unknown);
        sm.establish().unwrap();
        sm.close_by_host().unwrap();
        assert_eq!(sm.state(), ConnectionState::ClosingByHost);
        sm.finish().unwrap();
        assert_eq!(sm.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_passive_close_path() {
        let mut sm = StateMachine::new();
        sm.establish().unwrap();
        sm.close_by_peer().unwrap();
        assert_eq!(sm.state(), ConnectionState::ClosingByPeer);
        sm.finish().unwrap();
        assert_eq!(sm.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut sm = StateMachine::new();
        assert!(matches!(
            sm.close_by_host(),
            Err(Error::InvalidState {
                state: ConnectionState::Unknown,
                ..
            })
        ));
        assert!(sm.finish().is_err());

        sm.establish().unwrap();
        assert!(sm.establish().is_err());
        assert_eq!(sm.state(), ConnectionState::Established);
    }

    #[test]
    fn test_invalid_is_absorbing() {
        let mut sm = StateMachine::new();
        sm.establish().unwrap();
        sm.invalidate();
        assert!(sm.is_invalid());

        assert!(matches!(sm.establish(), Err(Error::ConnectionInvalid)));
        assert!(matches!(sm.close_by_peer(), Err(Error::ConnectionInvalid)));
        assert!(matches!(sm.finish(), Err(Error::ConnectionInvalid)));
        assert!(matches!(
            sm.require("send", &[ConnectionState::Established]),
            Err(Error::ConnectionInvalid)
        ));

        sm.invalidate();
        assert_eq!(sm.state(), ConnectionState::Invalid);
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::ClosingByPeer.to_string(), "CLOSING_BY_PEER");
        assert_eq!(ConnectionState::Invalid.to_string(), "INVALID");
    }
}

use serde::{Deserialize, Serialize};

/// `{deny, allowlist, full}`, ordered `deny < allowlist < full`.
///
/// `min_security` is commutative and associative with `deny` as the
/// absorbing element (§8 invariant, §4.F step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    Deny,
    Allowlist,
    Full,
}

pub fn min_security(a: SecurityMode, b: SecurityMode) -> SecurityMode {
    std::cmp::min(a, b)
}

/// `{off, on-miss, always}`, ordered `off < on-miss < always`.
///
/// `max_ask` is commutative and associative with `always` as the
/// absorbing element (§8 invariant, §4.F step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AskMode {
    Off,
    OnMiss,
    Always,
}

pub fn max_ask(a: AskMode, b: AskMode) -> AskMode {
    std::cmp::max(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecHost {
    Sandbox,
    Gateway,
    Node,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_security_commutative_and_associative() {
        let vals = [SecurityMode::Deny, SecurityMode::Allowlist, SecurityMode::Full];
        for a in vals {
            for b in vals {
                assert_eq!(min_security(a, b), min_security(b, a));
                for c in vals {
                    assert_eq!(
                        min_security(min_security(a, b), c),
                        min_security(a, min_security(b, c))
                    );
                }
            }
        }
    }

    #[test]
    fn deny_absorbs_in_min_security() {
        for other in [SecurityMode::Deny, SecurityMode::Allowlist, SecurityMode::Full] {
            assert_eq!(min_security(SecurityMode::Deny, other), SecurityMode::Deny);
        }
    }

    #[test]
    fn max_ask_commutative_and_associative() {
        let vals = [AskMode::Off, AskMode::OnMiss, AskMode::Always];
        for a in vals {
            for b in vals {
                assert_eq!(max_ask(a, b), max_ask(b, a));
                for c in vals {
                    assert_eq!(max_ask(max_ask(a, b), c), max_ask(a, max_ask(b, c)));
                }
            }
        }
    }

    #[test]
    fn always_absorbs_in_max_ask() {
        for other in [AskMode::Off, AskMode::OnMiss, AskMode::Always] {
            assert_eq!(max_ask(AskMode::Always, other), AskMode::Always);
        }
    }
}

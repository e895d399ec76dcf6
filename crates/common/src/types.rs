//! Core domain types shared by the Arbor server and its harness

use serde::{Deserialize, Serialize};

/// User role, ordered along the role ladder
/// `anon < user < researcher < provider < operator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anon,
    User,
    Researcher,
    Provider,
    Operator,
}

impl Role {
    /// Every role, lowest first.
    pub const LADDER: [Role; 5] = [
        Role::Anon,
        Role::User,
        Role::Researcher,
        Role::Provider,
        Role::Operator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Anon => "anon",
            Role::User => "user",
            Role::Researcher => "researcher",
            Role::Provider => "provider",
            Role::Operator => "operator",
        }
    }

    /// Position on the ladder, `anon` = 0.
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    /// Visibilities a caller with this role may read.
    pub fn visible_strata(&self) -> Vec<Visibility> {
        Visibility::ALL
            .iter()
            .copied()
            .filter(|v| v.min_role() <= *self)
            .collect()
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anon" => Ok(Self::Anon),
            "user" => Ok(Self::User),
            "researcher" => Ok(Self::Researcher),
            "provider" => Ok(Self::Provider),
            "operator" => Ok(Self::Operator),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// Node type. Roots are always claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Claim,
    Piece,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Claim => "claim",
            NodeType::Piece => "piece",
        }
    }
}

impl Default for NodeType {
    fn default() -> Self {
        Self::Claim
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claim" => Ok(Self::Claim),
            "piece" => Ok(Self::Piece),
            _ => Err(format!("unknown node type: {}", s)),
        }
    }
}

/// Visibility stratum of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Research,
    Provider,
    Instance,
}

impl Visibility {
    pub const ALL: [Visibility; 4] = [
        Visibility::Public,
        Visibility::Research,
        Visibility::Provider,
        Visibility::Instance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Research => "research",
            Visibility::Provider => "provider",
            Visibility::Instance => "instance",
        }
    }

    /// Lowest role allowed to read nodes in this stratum.
    pub fn min_role(&self) -> Role {
        match self {
            Visibility::Public => Role::Anon,
            Visibility::Research => Role::Researcher,
            Visibility::Provider => Role::Provider,
            Visibility::Instance => Role::Operator,
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Public
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "research" => Ok(Self::Research),
            "provider" => Ok(Self::Provider),
            "instance" => Ok(Self::Instance),
            _ => Err(format!("unknown visibility: {}", s)),
        }
    }
}

/// Outcome of a single test case as stored in the results database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pass,
    Fail,
    Skip,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pass => "pass",
            ResultStatus::Fail => "fail",
            ResultStatus::Skip => "skip",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "skip" => Ok(Self::Skip),
            _ => Err(format!("unknown result status: {}", s)),
        }
    }
}

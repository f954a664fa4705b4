//! Step identifiers, step kinds and routing decisions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Named step in the company-profile flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepId {
    InitialOverview,
    AskUserInterest,
    CheckUserInterest,
    ConductResearch,
    AskEmailInterest,
    CheckEmailProfileInterest,
    CollectEmail,
    ValidateEmail,
    SendCompanyProfile,
    HumanHandoff,
}

impl StepId {
    pub const ALL: [StepId; 10] = [
        StepId::InitialOverview,
        StepId::AskUserInterest,
        StepId::CheckUserInterest,
        StepId::ConductResearch,
        StepId::AskEmailInterest,
        StepId::CheckEmailProfileInterest,
        StepId::CollectEmail,
        StepId::ValidateEmail,
        StepId::SendCompanyProfile,
        StepId::HumanHandoff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::InitialOverview => "initial_overview",
            StepId::AskUserInterest => "ask_user_interest",
            StepId::CheckUserInterest => "check_user_interest",
            StepId::ConductResearch => "conduct_research",
            StepId::AskEmailInterest => "ask_email_interest",
            StepId::CheckEmailProfileInterest => "check_email_profile_interest",
            StepId::CollectEmail => "collect_email",
            StepId::ValidateEmail => "validate_email",
            StepId::SendCompanyProfile => "send_company_profile",
            StepId::HumanHandoff => "human_handoff",
        }
    }

    /// Every decision this step may write into the router.
    ///
    /// A conditional edge leaving the step must map exactly this set;
    /// the graph builder rejects anything else.
    pub fn decisions(self) -> &'static [Decision] {
        match self {
            StepId::InitialOverview => &[Decision::Initial],
            StepId::CheckUserInterest => &[Decision::MoreDetails, Decision::Overview],
            StepId::CheckEmailProfileInterest => &[Decision::EmailRequest, Decision::Overview],
            StepId::ValidateEmail => &[
                Decision::EmailValidated,
                Decision::CollectEmail,
                Decision::Handoff,
            ],
            _ => &[],
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the engine treats a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Calls the language model, may retrieve documents
    Generative,
    /// Pure suspension point; the engine halts before it
    Interrupt,
    /// Reads `user_feedback` and writes a router decision
    Classifier,
    /// Performs a side effect and sets terminal flags
    TerminalAction,
}

/// Symbolic routing decision written by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Overview delivered, go ask about interest
    Initial,
    /// User said yes
    MoreDetails,
    /// User said no, wrap up with the overview
    Overview,
    /// User wants the profile by email
    EmailRequest,
    /// Extracted a valid email address
    EmailValidated,
    /// No usable email, ask again
    CollectEmail,
    /// Gave up collecting, escalate to a person
    Handoff,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Initial => "initial",
            Decision::MoreDetails => "more_details",
            Decision::Overview => "overview",
            Decision::EmailRequest => "email_request",
            Decision::EmailValidated => "email_validated",
            Decision::CollectEmail => "collect_email",
            Decision::Handoff => "handoff",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

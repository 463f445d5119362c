use serde::{Deserialize, Serialize};

/// Pipeline stages in their declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    PrepareInput,
    BuildQueryItems,
    FilterQueryItems,
    BuildPrompt,
    EngineCall,
    ParseStreamedResponse,
    ParseResponse,
    UpdateQueryItems,
    Finalize,
}

impl Stage {
    pub const ORDER: [Stage; 9] = [
        Stage::PrepareInput,
        Stage::BuildQueryItems,
        Stage::FilterQueryItems,
        Stage::BuildPrompt,
        Stage::EngineCall,
        Stage::ParseStreamedResponse,
        Stage::ParseResponse,
        Stage::UpdateQueryItems,
        Stage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PrepareInput => "PrepareInput",
            Stage::BuildQueryItems => "BuildQueryItems",
            Stage::FilterQueryItems => "FilterQueryItems",
            Stage::BuildPrompt => "BuildPrompt",
            Stage::EngineCall => "EngineCall",
            Stage::ParseStreamedResponse => "ParseStreamedResponse",
            Stage::ParseResponse => "ParseResponse",
            Stage::UpdateQueryItems => "UpdateQueryItems",
            Stage::Finalize => "Finalize",
        }
    }

    pub fn parse(raw: &str) -> Option<Stage> {
        Stage::ORDER.iter().copied().find(|s| s.as_str() == raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_and_parse_round_trip() {
        assert_eq!(Stage::ORDER.len(), 9);
        assert_eq!(Stage::ORDER[0], Stage::PrepareInput);
        assert_eq!(Stage::ORDER[8], Stage::Finalize);
        for stage in Stage::ORDER {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert!(Stage::parse("NotAStage").is_none());
    }
}

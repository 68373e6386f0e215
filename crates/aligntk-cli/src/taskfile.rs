//! On-disk task list read by `prun`'s master (§3 "Work unit", §6 "CLI
//! surface"): a TOML document naming each unit's program, arguments, and
//! a stable id.

use std::path::Path;

use serde::{Deserialize, Serialize};

use aligntk_dispatch::unit::{WorkKind, WorkUnit};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: u64,
    pub kind: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TaskList {
    pub units: Vec<TaskSpec>,
}

impl TaskList {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let list: TaskList = toml::from_str(&text)?;
        Ok(list)
    }

    pub fn into_work_units(self) -> anyhow::Result<Vec<WorkUnit>> {
        self.units
            .into_iter()
            .map(|spec| {
                let kind = match spec.kind.as_str() {
                    "build_pyramid" => WorkKind::BuildPyramid,
                    "register_pair" => WorkKind::RegisterPair,
                    "relaxation_block" => WorkKind::RelaxationBlock,
                    other => anyhow::bail!("unknown task kind {other:?}"),
                };
                Ok(WorkUnit::new(spec.id, kind, spec.program, spec.args))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_task_list() {
        let toml_text = r#"
            [[units]]
            id = 0
            kind = "register_pair"
            program = "register"
            args = ["--moving", "a", "--reference", "b"]
        "#;
        let list: TaskList = toml::from_str(toml_text).unwrap();
        let units = list.into_work_units().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].id, 0);
        assert_eq!(units[0].kind, WorkKind::RegisterPair);
    }
}

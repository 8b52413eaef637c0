use serde_json::Value;

/// Chooses between human text and one JSON document per command.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Prints `value` when in JSON mode, otherwise runs `human`.
    pub fn report(&self, value: Value, human: impl FnOnce()) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(&value)?);
        } else {
            human();
        }
        Ok(())
    }

    pub fn error(&self, err: &anyhow::Error) {
        if self.json {
            let value = serde_json::json!({"ok": false, "error": format!("{err:#}")});
            println!("{value}");
        } else {
            eprintln!("error: {err:#}");
        }
    }
}

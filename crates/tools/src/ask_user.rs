//! Declaration of the `ask_user` tool. The engine intercepts calls to it.

use serde_json::json;
use turnloop_core::FunctionDeclaration;

pub const NAME: &str = "ask_user";

pub fn declaration() -> FunctionDeclaration {
    FunctionDeclaration::new(
        NAME,
        "Ask the user one or more questions to gather preferences, clarify requirements, or make \
         decisions. Use when you need user input before proceeding.",
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "description": "Questions to ask the user (1-4 questions).",
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": {
                                "type": "string",
                                "description": "The question to ask, ending with a question mark."
                            },
                            "header": {
                                "type": "string",
                                "description": "Very short label (max 16 chars), e.g. 'Auth method'."
                            },
                            "type": {
                                "type": "string",
                                "description": "'choice' for multiple choice, 'text' for free form, 'yesno' for confirmation.",
                                "enum": ["choice", "text", "yesno"]
                            },
                            "options": {
                                "type": "array",
                                "description": "Choices for 'choice' questions.",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "label": {"type": "string", "description": "Option display text (1-5 words)."},
                                        "description": {"type": "string", "description": "Brief explanation of this option."}
                                    },
                                    "required": ["label", "description"]
                                }
                            }
                        },
                        "required": ["question", "header"]
                    }
                }
            },
            "required": ["questions"]
        }),
    )
}

// Approval Gate
// Creating an approval suspends the task to waiting_approval; the gate polls
// the store until the approval is terminal or the run is canceled (which
// expires it). Terminal approvals are immutable.

use std::time::Duration;

use serde_json::{json, Value};

use astra_core::{EventBus, SqliteStore};
use astra_types::{
    Approval, ApprovalStatus, EventLevel, EventType, PlanStep, Run, RunStatus, Task, TaskStatus,
};

use crate::error::{EngineError, Result};

const APPROVAL_POLL: Duration = Duration::from_millis(500);

/// Danger flag to approval type, highest-risk flag first.
pub fn approval_type_from_flags(flags: &[String]) -> &'static str {
    const PRIORITY: &[(&str, &str)] = &[
        ("payment", "PAYMENT"),
        ("delete_file", "DELETE"),
        ("send_message", "SEND"),
        ("publish", "PUBLISH"),
        ("account_settings", "ACCOUNT_CHANGE"),
        ("password", "ACCOUNT_CHANGE"),
    ];
    for (flag, approval_type) in PRIORITY {
        if flags.iter().any(|item| item == flag) {
            return approval_type;
        }
    }
    "ACCOUNT_CHANGE"
}

fn approval_risk(approval_type: &str) -> &'static str {
    match approval_type {
        "SEND" => "Отправка сообщения/публикация",
        "DELETE" => "Удаление или необратимое изменение",
        "PAYMENT" => "Оплата/перевод/подписка",
        "PUBLISH" => "Публикация контента",
        _ => "Изменение настроек аккаунта или безопасности",
    }
}

fn suggested_action(approval_type: &str) -> &'static str {
    match approval_type {
        "SEND" => "Проверьте получателя и текст сообщения",
        "DELETE" => "Подтвердите список удаляемых объектов",
        "PAYMENT" => "Подтвердите сумму и получателя",
        "PUBLISH" => "Подтвердите площадку и содержание",
        _ => "Подтвердите изменение настроек аккаунта",
    }
}

/// Preview shown with the approval request.
pub fn build_preview_for_step(run: &Run, step: &PlanStep, approval_type: &str) -> Value {
    let summary = step
        .title
        .clone()
        .unwrap_or_else(|| run.query_text.clone());
    let inputs = &step.inputs;
    let details = match approval_type {
        "SEND" => json!({
            "target_app": inputs.get("app").cloned().unwrap_or(json!("UNKNOWN")),
            "message_text": inputs
                .get("message_text")
                .or_else(|| inputs.get("text"))
                .cloned()
                .unwrap_or(json!("UNKNOWN")),
            "destination_hint": inputs.get("destination").cloned().unwrap_or(json!("UNKNOWN")),
        }),
        "DELETE" => json!({
            "items": inputs.get("items").cloned().unwrap_or(json!("UNKNOWN")),
            "impact": inputs.get("impact").cloned().unwrap_or(json!("UNKNOWN")),
        }),
        "PAYMENT" => json!({
            "amount": inputs.get("amount").cloned().unwrap_or(json!("UNKNOWN")),
            "currency": inputs.get("currency").cloned().unwrap_or(json!("UNKNOWN")),
            "merchant": inputs.get("merchant").cloned().unwrap_or(json!("UNKNOWN")),
        }),
        "PUBLISH" => {
            let content = inputs
                .get("content")
                .and_then(Value::as_str)
                .map(|content| {
                    if content.chars().count() > 120 {
                        content.chars().take(120).collect::<String>() + "…"
                    } else {
                        content.to_string()
                    }
                })
                .unwrap_or_else(|| "UNKNOWN".to_string());
            json!({
                "platform_hint": inputs.get("platform").cloned().unwrap_or(json!("UNKNOWN")),
                "content_preview": content,
            })
        }
        _ => json!({
            "change": inputs.get("change").cloned().unwrap_or(json!("UNKNOWN")),
        }),
    };

    json!({
        "summary": summary,
        "details": details,
        "risk": approval_risk(approval_type),
        "suggested_user_action": suggested_action(approval_type),
        "danger_flags": step.danger_flags,
        "kind": step.kind.as_str(),
        "expires_in_ms": null,
    })
}

#[derive(Clone)]
pub struct ApprovalGate {
    store: std::sync::Arc<SqliteStore>,
    bus: EventBus,
}

impl ApprovalGate {
    pub fn new(store: std::sync::Arc<SqliteStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Gate a step on explicit user approval. True means approved.
    pub async fn request_step_approval(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
    ) -> Result<bool> {
        let approval_type = approval_type_from_flags(&step.danger_flags);
        let preview = build_preview_for_step(run, step, approval_type);
        self.request(
            run,
            step,
            task,
            "computer_step",
            "Подтверждение действия",
            "Требуется подтверждение для выполнения шага на компьютере.",
            preview,
            None,
        )
        .await
    }

    /// The executor cannot make progress; ask the user to intervene.
    pub async fn request_user_help(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        reason: &str,
    ) -> Result<bool> {
        let preview = json!({
            "title": step.title,
            "kind": step.kind.as_str(),
            "reason": reason,
        });
        self.bus
            .emit(
                &run.id,
                EventType::UserActionRequired,
                "Нужно вмешательство пользователя",
                json!({ "reason": reason, "step_id": step.id }),
                EventLevel::Warning,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        self.request(
            run,
            step,
            task,
            "executor_help",
            "Нужно вмешательство",
            "Executor не может продолжить без подтверждения пользователя.",
            preview,
            Some(reason),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn request(
        &self,
        run: &Run,
        step: &PlanStep,
        task: &Task,
        scope: &str,
        title: &str,
        description: &str,
        preview: Value,
        reason: Option<&str>,
    ) -> Result<bool> {
        let approval = self
            .store
            .create_approval(&run.id, &task.id, scope, title, description, &[preview.clone()])
            .await?;

        self.bus
            .emit(
                &run.id,
                EventType::ApprovalRequested,
                "Запрошено подтверждение",
                json!({
                    "approval_id": approval.id,
                    "scope": approval.scope,
                    "title": approval.title,
                    "description": approval.description,
                    "proposed_actions": approval.proposed_actions,
                    "reason": reason,
                }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        self.bus
            .emit(
                &run.id,
                EventType::StepPausedForApproval,
                "Шаг ожидает подтверждение",
                json!({ "approval_id": approval.id, "preview": preview }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;

        self.store
            .update_task_status(&task.id, TaskStatus::WaitingApproval)
            .await?;
        let resolved = self.wait_for_approval(&run.id, &approval.id).await?;

        self.bus
            .emit(
                &run.id,
                EventType::ApprovalResolved,
                "Подтверждение завершено",
                json!({
                    "approval_id": resolved.id,
                    "status": resolved.status,
                    "decision": resolved.decision,
                }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;

        if resolved.status != ApprovalStatus::Approved {
            self.bus
                .emit(
                    &run.id,
                    EventType::ApprovalRejected,
                    "Подтверждение отклонено",
                    json!({ "approval_id": resolved.id }),
                    EventLevel::Warning,
                    Some(&task.id),
                    Some(&step.id),
                )
                .await?;
            return Ok(false);
        }

        self.bus
            .emit(
                &run.id,
                EventType::ApprovalApproved,
                "Подтверждение принято",
                json!({ "approval_id": resolved.id }),
                EventLevel::Info,
                Some(&task.id),
                Some(&step.id),
            )
            .await?;
        self.store
            .update_task_status(&task.id, TaskStatus::Running)
            .await?;
        Ok(true)
    }

    /// Poll until terminal. A canceled run expires the pending approval.
    pub async fn wait_for_approval(&self, run_id: &str, approval_id: &str) -> Result<Approval> {
        loop {
            let approval = self
                .store
                .get_approval(approval_id)
                .await?
                .ok_or_else(|| EngineError::NotFound("approval not found".to_string()))?;
            if approval.status.is_terminal() {
                return Ok(approval);
            }
            if let Some(run) = self.store.get_run(run_id).await? {
                if run.status == RunStatus::Canceled {
                    let expired = self
                        .store
                        .update_approval_status(approval_id, ApprovalStatus::Expired, "system")
                        .await?;
                    return expired
                        .ok_or_else(|| EngineError::NotFound("approval not found".to_string()));
                }
            }
            tokio::time::sleep(APPROVAL_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_flag_wins_priority() {
        let flags = vec!["send_message".to_string(), "payment".to_string()];
        assert_eq!(approval_type_from_flags(&flags), "PAYMENT");
        assert_eq!(approval_type_from_flags(&["delete_file".to_string()]), "DELETE");
        assert_eq!(approval_type_from_flags(&[]), "ACCOUNT_CHANGE");
    }
}

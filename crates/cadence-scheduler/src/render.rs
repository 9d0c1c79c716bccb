//! Message rendering for a claimed queue item.

use cadence_core::SEND_ID_HEADER;
use cadence_core::template::{TemplateVars, render};
use cadence_core::types::{EnrollmentRecipient, OutgoingEmail, QueueItem, SequenceStep};

/// Template variables for a recipient.
pub fn vars_for(recipient: &EnrollmentRecipient) -> TemplateVars {
    TemplateVars {
        first_name: recipient.first_name.clone(),
        last_name: recipient.last_name.clone(),
        company: recipient.company.clone(),
        email: recipient.email.clone(),
        job_title: recipient.job_title.clone(),
        phone: recipient.phone.clone(),
    }
}

/// Render the step matching `item.step_index + 1`, or the canary test
/// message when the sequence has no such step.
///
/// The queue item id is stamped into the correlation header.
pub fn build_email(
    item: &QueueItem,
    recipient: &EnrollmentRecipient,
    step: Option<&SequenceStep>,
) -> OutgoingEmail {
    let (subject, html, text) = match step {
        Some(step) => {
            let vars = vars_for(recipient);
            (
                render(&step.subject, &vars),
                render(&step.html_body, &vars),
                step.text_body.as_deref().map(|t| render(t, &vars)),
            )
        }
        None => canary_message(item),
    };

    OutgoingEmail {
        to: recipient.email.clone(),
        subject,
        html,
        text,
        headers: vec![(SEND_ID_HEADER.to_string(), item.id.clone())],
    }
}

fn canary_message(item: &QueueItem) -> (String, String, Option<String>) {
    let subject = format!("[Cadence canary] enrollment {} step {}", item.enrollment_id, item.step_index);
    let text = format!(
        "Canary test message.\nEnrollment: {}\nStep index: {}\nRecipient: {}\n",
        item.enrollment_id, item.step_index, item.recipient_email
    );
    let html = format!(
        "<p>Canary test message.</p><ul><li>Enrollment: {}</li><li>Step index: {}</li><li>Recipient: {}</li></ul>",
        item.enrollment_id, item.step_index, item.recipient_email
    );
    (subject, html, Some(text))
}

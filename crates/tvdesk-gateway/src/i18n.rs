//! Localized notification copy.
//!
//! Templates use `{field}` placeholders filled from the notification's `data`
//! object. Missing fields render as an empty string.

use serde_json::Value;

use tvdesk_types::models::NotificationKind;

pub const DEFAULT_LOCALE: &str = "en";

/// Longest chat preview placed in a notification body, in characters.
const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Locale {
    En,
    Fr,
    Es,
}

impl Locale {
    /// Accepts tags like `fr`, `fr-CA`, `es_MX`. Anything else is English.
    fn parse(tag: &str) -> Self {
        let primary = tag.split(['-', '_']).next().unwrap_or_default().to_ascii_lowercase();
        match primary.as_str() {
            "fr" => Self::Fr,
            "es" => Self::Es,
            _ => Self::En,
        }
    }
}

fn templates(kind: NotificationKind, locale: Locale) -> (&'static str, &'static str) {
    use NotificationKind::*;
    match (locale, kind) {
        (Locale::En, FreeTrialRequested) => ("Free trial requested", "{userName} requested a free trial."),
        (Locale::En, FreeTrialActivated) => ("Your free trial is active", "Enjoy {hours} hours of unlimited streaming."),
        (Locale::En, SubscriptionCreated) => ("New subscription", "{userName} subscribed to {plan}."),
        (Locale::En, SubscriptionActivated) => ("Subscription activated", "Your {plan} plan is now active."),
        (Locale::En, SubscriptionExpiring) => ("Subscription expiring soon", "Your {plan} plan expires in {days} days."),
        (Locale::En, PaymentReceived) => ("Payment received", "We received your payment of {amount} {currency}."),
        (Locale::En, ChatMessage) => ("New message from {senderName}", "{preview}"),

        (Locale::Fr, FreeTrialRequested) => ("Essai gratuit demandé", "{userName} a demandé un essai gratuit."),
        (Locale::Fr, FreeTrialActivated) => ("Votre essai gratuit est actif", "Profitez de {hours} heures de streaming illimité."),
        (Locale::Fr, SubscriptionCreated) => ("Nouvel abonnement", "{userName} s'est abonné à {plan}."),
        (Locale::Fr, SubscriptionActivated) => ("Abonnement activé", "Votre forfait {plan} est maintenant actif."),
        (Locale::Fr, SubscriptionExpiring) => ("Abonnement bientôt expiré", "Votre forfait {plan} expire dans {days} jours."),
        (Locale::Fr, PaymentReceived) => ("Paiement reçu", "Nous avons reçu votre paiement de {amount} {currency}."),
        (Locale::Fr, ChatMessage) => ("Nouveau message de {senderName}", "{preview}"),

        (Locale::Es, FreeTrialRequested) => ("Prueba gratuita solicitada", "{userName} solicitó una prueba gratuita."),
        (Locale::Es, FreeTrialActivated) => ("Tu prueba gratuita está activa", "Disfruta de {hours} horas de streaming ilimitado."),
        (Locale::Es, SubscriptionCreated) => ("Nueva suscripción", "{userName} se suscribió a {plan}."),
        (Locale::Es, SubscriptionActivated) => ("Suscripción activada", "Tu plan {plan} ya está activo."),
        (Locale::Es, SubscriptionExpiring) => ("Tu suscripción vence pronto", "Tu plan {plan} vence en {days} días."),
        (Locale::Es, PaymentReceived) => ("Pago recibido", "Recibimos tu pago de {amount} {currency}."),
        (Locale::Es, ChatMessage) => ("Nuevo mensaje de {senderName}", "{preview}"),
    }
}

/// Render `(title, body)` for one recipient.
pub fn render(kind: NotificationKind, locale: &str, data: &Value) -> (String, String) {
    let (title, body) = templates(kind, Locale::parse(locale));
    (fill(title, data), fill(body, data))
}

/// Shorten a chat body for the notification preview.
pub fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(PREVIEW_CHARS - 1).collect();
    out.push('…');
    out
}

fn fill(template: &str, data: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&field(data, &after[..end]));
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn field(data: &Value, name: &str) -> String {
    match data.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

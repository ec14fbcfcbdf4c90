use chrono::{DateTime, Datelike, Utc, Weekday};
use chrono_tz::America::Santiago;
use chrono_tz::Tz;
use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

/// Builds the system turn: sheet context plus the current Spanish weekday,
/// date and time in Santiago de Chile.
pub fn render_system_prompt(context_text: &str) -> String {
    render_system_prompt_at(context_text, Utc::now().with_timezone(&Santiago))
}

pub fn render_system_prompt_at(context_text: &str, now: DateTime<Tz>) -> String {
    let weekday = spanish_weekday(now.weekday());
    let date = now.format("%d-%m-%y").to_string();
    let time = now.format("%H:%M").to_string();

    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(context_text, weekday, &date, &time);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(context_text, weekday, &date, &time);
    };

    template
        .render(context! {
            context => context_text,
            weekday => weekday,
            date => date,
            time => time,
        })
        .unwrap_or_else(|_| fallback_system_prompt(context_text, weekday, &date, &time))
}

fn spanish_weekday(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "Lunes",
        Weekday::Tue => "Martes",
        Weekday::Wed => "Miércoles",
        Weekday::Thu => "Jueves",
        Weekday::Fri => "Viernes",
        Weekday::Sat => "Sábado",
        Weekday::Sun => "Domingo",
    }
}

fn fallback_system_prompt(context_text: &str, weekday: &str, date: &str, time: &str) -> String {
    format!(
        "{context_text}\nHoy es {weekday}. La fecha actual es: {date}. \
         La hora actual en Santiago de Chile es: {time}."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn prompt_appends_localized_date_line() {
        // 2024-09-16 was a Monday.
        let now = Santiago.with_ymd_and_hms(2024, 9, 16, 14, 30, 0).unwrap();
        let prompt = render_system_prompt_at("Horario: lunes a viernes.", now);
        assert_eq!(
            prompt,
            "Horario: lunes a viernes.\nHoy es Lunes. La fecha actual es: 16-09-24. \
             La hora actual en Santiago de Chile es: 14:30."
        );
    }

    #[test]
    fn empty_context_still_renders_the_date_line() {
        let now = Santiago.with_ymd_and_hms(2024, 9, 22, 9, 5, 0).unwrap();
        let prompt = render_system_prompt_at("", now);
        assert!(prompt.starts_with("\nHoy es Domingo."));
        assert!(prompt.contains("La hora actual en Santiago de Chile es: 09:05."));
    }

    #[test]
    fn weekdays_translate_to_spanish() {
        assert_eq!(spanish_weekday(Weekday::Wed), "Miércoles");
        assert_eq!(spanish_weekday(Weekday::Sat), "Sábado");
    }
}

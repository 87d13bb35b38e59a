//! Human-readable schedule descriptions (Chinese), used when echoing a job
//! back to the user.

use chrono::TimeZone;

use crate::model::Schedule;

fn weekday_name(field: &str) -> Option<&'static str> {
    match field {
        "0" | "7" => Some("周日"),
        "1" => Some("周一"),
        "2" => Some("周二"),
        "3" => Some("周三"),
        "4" => Some("周四"),
        "5" => Some("周五"),
        "6" => Some("周六"),
        "1-5" => Some("工作日"),
        "0,6" | "6,0" | "6,7" | "7,6" => Some("周末"),
        _ => None,
    }
}

/// Describe a 5-field cron expression for common patterns, falling back to
/// the raw expression.
pub fn cron_to_human(expression: &str) -> String {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        return format!("Cron: {expression}");
    }
    let (minute, hour, day, month, weekday) = (parts[0], parts[1], parts[2], parts[3], parts[4]);

    if day == "*" && month == "*" {
        if weekday == "*" {
            if let (Ok(_), Ok(_)) = (hour.parse::<u32>(), minute.parse::<u32>()) {
                if minute == "0" {
                    return format!("每天 {hour}:00");
                }
                return format!("每天 {hour}:{minute:0>2}");
            }
        } else if let Some(wd) = weekday_name(weekday) {
            if hour.parse::<u32>().is_ok() && minute.parse::<u32>().is_ok() {
                if minute == "0" {
                    return format!("每{wd} {hour}:00");
                }
                return format!("每{wd} {hour}:{minute:0>2}");
            }
        }
    }

    if hour == "*" && day == "*" && month == "*" && weekday == "*" {
        if let Some(step) = minute.strip_prefix("*/") {
            return format!("每隔 {step} 分钟");
        }
    }
    if minute == "0" && day == "*" && month == "*" && weekday == "*" {
        if let Some(step) = hour.strip_prefix("*/") {
            return format!("每隔 {step} 小时");
        }
    }

    format!("Cron: {expression}")
}

/// Describe a fixed interval.
pub fn interval_to_human(interval_ms: i64) -> String {
    let seconds = interval_ms / 1000;
    if seconds < 60 {
        format!("每隔 {seconds} 秒")
    } else if seconds < 3600 {
        format!("每隔 {} 分钟", seconds / 60)
    } else if seconds < 86400 {
        format!("每隔 {} 小时", seconds / 3600)
    } else {
        format!("每隔 {} 天", seconds / 86400)
    }
}

/// Describe any schedule.
pub fn schedule_to_human(schedule: &Schedule) -> String {
    match schedule {
        Schedule::At { at_ms } => {
            if *at_ms > 0 {
                match chrono::Utc.timestamp_millis_opt(*at_ms).single() {
                    Some(dt) => {
                        format!("在 {} 执行一次", dt.format("%Y-%m-%d %H:%M"))
                    }
                    None => "未设置执行时间".to_string(),
                }
            } else {
                "未设置执行时间".to_string()
            }
        }
        Schedule::Every { interval_ms } => interval_to_human(*interval_ms),
        Schedule::Cron { expression, .. } => cron_to_human(expression),
    }
}

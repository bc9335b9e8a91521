use maud::{html, Markup, PreEscaped, DOCTYPE};

use crate::library::{Catalog, LibraryView, ALL};
use crate::timer::{PomodoroTimer, PRESETS, RING_CIRCUMFERENCE};
use crate::types::{AuthUser, TimerStats};

/// Everything the page shows for one request
pub struct PageModel<'a> {
    pub catalog: &'a Catalog,
    pub view: &'a LibraryView,
    pub user: Option<&'a AuthUser>,
    pub favorites: &'a [String],
    pub stats: TimerStats,
    pub timer: &'a PomodoroTimer,
}

pub fn render_page(model: &PageModel) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { "Course Desk" }
                style { (PreEscaped(CSS)) }
            }
            body {
                div.container {
                    header.top {
                        h1 { "Course Desk" }
                        (render_account(model.user))
                    }
                    (render_courses(model))
                    (render_library(model.catalog, model.view))
                    (render_timer(model.timer, model.stats))
                    (render_forms())
                }
                div #"toasts" {}
                script { (PreEscaped(JAVASCRIPT)) }
            }
        }
    }
}

fn render_account(user: Option<&AuthUser>) -> Markup {
    html! {
        div.account #"account" {
            @match user {
                Some(user) => {
                    span.user-name { (user.fallback_name()) }
                    button #"signout" type="button" { "Logout" }
                }
                None => {
                    form #"signin-form" {
                        input type="email" name="email" placeholder="Email" required;
                        input type="password" name="password" placeholder="Password" required;
                        button type="submit" { "Login" }
                    }
                    button #"oauth-google" type="button" data-provider="google" { "Sign in with Google" }
                }
            }
        }
    }
}

fn render_courses(model: &PageModel) -> Markup {
    let courses = model.catalog.search_courses(&model.view.search);
    html! {
        section.courses {
            h2 { "Courses" }
            input #"search" type="search" placeholder="Search courses and books" value=(model.view.search);
            @if courses.is_empty() {
                div.empty-state { p { "No courses found." } }
            } @else {
                table.course-table {
                    @for course in &courses {
                        @let favorite = model.favorites.iter().any(|f| f == &course.code);
                        tr data-course-code=(course.code) data-course-name=(course.name) {
                            td.code { (course.code) }
                            td.name { (course.name) }
                            td {
                                a.download href=(course.url) target="_blank" rel="noopener" { "Open" }
                            }
                            td {
                                button.favorite-btn.active[favorite] type="button" data-course=(course.code) {
                                    @if favorite { "★" } @else { "☆" }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn render_library(catalog: &Catalog, view: &LibraryView) -> Markup {
    let snapshot = view.snapshot(catalog);
    html! {
        section.library #"library" {
            h2 { "Library" }
            div.filters {
                @for (filter, count) in &snapshot.counts {
                    button.filter-btn.active[*filter == view.filter] type="button" data-filter=(filter) {
                        @if filter == ALL { "All" } @else { (filter) }
                        span.count { (count) }
                    }
                }
            }
            button #"library-toggle" type="button" {
                @if snapshot.expanded { "Hide books" } @else { "Show books" }
            }
            @if snapshot.expanded {
                div.books {
                    @for book in &snapshot.books {
                        figure.book data-category=(book.category) {
                            a.download href=(book.url) target="_blank" rel="noopener" { "Open" }
                            figcaption { (book.title) }
                        }
                    }
                }
                @if snapshot.has_more {
                    button #"load-more" type="button" { "Load more" }
                }
            }
        }
    }
}

fn render_timer(timer: &PomodoroTimer, stats: TimerStats) -> Markup {
    html! {
        section.timer #"timer" data-minutes=(timer.preset_minutes()) {
            h2 { "Study Timer" }
            div.presets {
                @for minutes in PRESETS {
                    button.preset.active[minutes == timer.preset_minutes()] type="button" data-minutes=(minutes) {
                        (minutes) " min"
                    }
                }
            }
            svg.ring width="240" height="240" {
                circle cx="120" cy="120" r="110"
                    stroke-dasharray=(RING_CIRCUMFERENCE)
                    stroke-dashoffset=(timer.progress_offset()) {}
            }
            div.display #"timer-display" { (timer.display()) }
            div.phase #"timer-phase" { (timer.phase().label()) }
            div.controls {
                button #"timer-start" type="button" { "Start" }
                button #"timer-pause" type="button" { "Pause" }
                button #"timer-reset" type="button" { "Reset" }
            }
            div.stats {
                span #"sessions-completed" { (stats.sessions_completed) }
                " sessions, "
                span #"total-minutes" { (stats.total_minutes) }
                " minutes"
            }
        }
    }
}

fn render_forms() -> Markup {
    html! {
        section.forms {
            form #"contact-form" {
                h2 { "Contact" }
                input name="fromName" placeholder="Name" required;
                input name="fromEmail" type="email" placeholder="Email" required;
                input name="subject" placeholder="Subject" required;
                textarea name="message" placeholder="Message" required {}
                button type="submit" { "Send" }
            }
            form #"newsletter-form" {
                h2 { "Newsletter" }
                input name="email" type="email" placeholder="Email" required;
                button type="submit" { "Subscribe" }
            }
        }
    }
}

const CSS: &str = r#"
* { margin: 0; padding: 0; box-sizing: border-box; }

body {
    font-family: -apple-system, BlinkMacSystemFont, sans-serif;
    background: #111;
    color: #eee;
    line-height: 1.4;
}

.container { max-width: 1000px; margin: 0 auto; padding: 32px 20px 60px; }
.top { display: flex; justify-content: space-between; align-items: center; margin-bottom: 32px; }
section { margin-bottom: 40px; }
h2 { margin-bottom: 12px; text-transform: uppercase; letter-spacing: 0.1em; font-size: 1em; }

.course-table { width: 100%; border-collapse: collapse; }
.course-table td { padding: 8px; border-bottom: 1px solid #333; }
.favorite-btn { background: none; border: none; color: #888; font-size: 1.3em; cursor: pointer; }
.favorite-btn.active { color: #ffc107; }
.favorite-btn:disabled { opacity: 0.4; cursor: wait; }

.filters { display: flex; gap: 8px; flex-wrap: wrap; margin-bottom: 12px; }
.filter-btn.active, .preset.active { background: #00bcd4; color: #000; }
.count { margin-left: 6px; font-size: 0.8em; opacity: 0.7; }
.books { display: grid; grid-template-columns: repeat(auto-fill, minmax(150px, 1fr)); gap: 16px; margin-top: 12px; }

.ring circle { fill: none; stroke: #00bcd4; stroke-width: 8; transform: rotate(-90deg); transform-origin: center; }
.display { font-size: 3em; font-weight: 700; }

#toasts { position: fixed; right: 20px; bottom: 20px; display: grid; gap: 8px; }
.toast { padding: 12px 16px; background: #222; border-left: 4px solid #00bcd4; }
.toast.error { border-color: #f44336; }
.toast.success { border-color: #4caf50; }

.empty-state { padding: 40px 20px; text-align: center; color: #666; }
"#;

const JAVASCRIPT: &str = r#"
const TOKEN_KEY = 'coursedesk-session';

async function api(method, path, body) {
    const headers = { 'Content-Type': 'application/json' };
    const token = localStorage.getItem(TOKEN_KEY);
    if (token) headers['Authorization'] = `Bearer ${token}`;
    const res = await fetch(path, { method, headers, body: body ? JSON.stringify(body) : undefined });
    const data = await res.json().catch(() => ({}));
    if (data.token) localStorage.setItem(TOKEN_KEY, data.token);
    await showToasts();
    return { ok: res.ok, data };
}

async function showToasts() {
    const token = localStorage.getItem(TOKEN_KEY);
    if (!token) return;
    const res = await fetch('/api/toasts', { headers: { 'Authorization': `Bearer ${token}` } });
    if (!res.ok) return;
    for (const toast of await res.json()) {
        const el = document.createElement('div');
        el.className = `toast ${toast.level}`;
        el.textContent = toast.message;
        document.getElementById('toasts').appendChild(el);
        setTimeout(() => el.remove(), toast.durationMs);
    }
}

function formData(form) {
    return Object.fromEntries(new FormData(form).entries());
}

document.getElementById('signin-form')?.addEventListener('submit', async e => {
    e.preventDefault();
    const { ok } = await api('POST', '/api/auth/signin', formData(e.target));
    if (ok) location.reload();
});

document.getElementById('oauth-google')?.addEventListener('click', async e => {
    const { ok } = await api('POST', '/api/auth/oauth', { provider: e.target.dataset.provider });
    if (ok) location.reload();
});

document.getElementById('signout')?.addEventListener('click', async () => {
    const { ok } = await api('POST', '/api/auth/signout');
    if (ok) { localStorage.removeItem(TOKEN_KEY); location.reload(); }
});

document.querySelectorAll('.favorite-btn').forEach(btn => {
    btn.addEventListener('click', async () => {
        document.querySelectorAll('.favorite-btn').forEach(b => b.disabled = true);
        const { ok } = await api('POST', `/api/favorites/${encodeURIComponent(btn.dataset.course)}/toggle`);
        if (ok) {
            btn.classList.toggle('active');
            btn.textContent = btn.classList.contains('active') ? '★' : '☆';
        }
        document.querySelectorAll('.favorite-btn').forEach(b => b.disabled = false);
    });
});

document.querySelectorAll('a.download').forEach(link => {
    link.addEventListener('click', () => {
        const row = link.closest('tr');
        const figure = link.closest('figure');
        api('POST', '/api/downloads', {
            url: link.href,
            courseCode: row?.dataset.courseCode,
            courseName: row?.dataset.courseName,
            caption: figure?.querySelector('figcaption')?.textContent,
        });
    });
});

['contact-form', 'newsletter-form'].forEach(id => {
    document.getElementById(id)?.addEventListener('submit', async e => {
        e.preventDefault();
        const path = id === 'contact-form' ? '/api/contact' : '/api/newsletter';
        const { ok } = await api('POST', path, formData(e.target));
        if (ok) e.target.reset();
    });
});

const timer = { minutes: 25, remaining: 25 * 60, handle: null };
const display = document.getElementById('timer-display');
function renderTimer() {
    const m = String(Math.floor(timer.remaining / 60)).padStart(2, '0');
    const s = String(timer.remaining % 60).padStart(2, '0');
    display.textContent = `${m}:${s}`;
    const ring = document.querySelector('.ring circle');
    ring.style.strokeDashoffset = 691 - (timer.remaining / (timer.minutes * 60)) * 691;
}
function pauseTimer() { clearInterval(timer.handle); timer.handle = null; }
document.querySelectorAll('.preset').forEach(btn => btn.addEventListener('click', () => {
    pauseTimer();
    timer.minutes = Number(btn.dataset.minutes);
    timer.remaining = timer.minutes * 60;
    document.getElementById('timer-phase').textContent = timer.minutes >= 20 ? 'Focus Time' : 'Break Time';
    renderTimer();
}));
document.getElementById('timer-start').addEventListener('click', () => {
    if (timer.handle) return;
    timer.handle = setInterval(async () => {
        timer.remaining -= 1;
        renderTimer();
        if (timer.remaining <= 0) {
            pauseTimer();
            const { data } = await api('POST', '/api/timer/complete', { minutes: timer.minutes });
            if (data.stats) {
                document.getElementById('sessions-completed').textContent = data.stats.sessionsCompleted;
                document.getElementById('total-minutes').textContent = data.stats.totalMinutes;
            }
            timer.remaining = timer.minutes * 60;
        }
    }, 1000);
});
document.getElementById('timer-pause').addEventListener('click', pauseTimer);
document.getElementById('timer-reset').addEventListener('click', () => {
    pauseTimer();
    timer.remaining = timer.minutes * 60;
    renderTimer();
});

showToasts();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{Book, Course};

    fn catalog() -> Catalog {
        Catalog {
            courses: vec![
                Course {
                    code: "EENG 101".to_string(),
                    name: "Circuits I".to_string(),
                    url: "https://drive.google.com/c1".to_string(),
                },
                Course {
                    code: "EENG 305".to_string(),
                    name: "Signals".to_string(),
                    url: "https://drive.google.com/c2".to_string(),
                },
            ],
            books: vec![Book {
                title: "Signals and Systems".to_string(),
                category: "signals".to_string(),
                url: "https://drive.google.com/b1".to_string(),
            }],
        }
    }

    fn render(view: &LibraryView, user: Option<&AuthUser>, favorites: &[String]) -> String {
        let catalog = catalog();
        let timer = PomodoroTimer::default();
        render_page(&PageModel {
            catalog: &catalog,
            view,
            user,
            favorites,
            stats: TimerStats::new(4, 100),
            timer: &timer,
        })
        .into_string()
    }

    #[test]
    fn test_renders_courses_and_favorites() {
        let html = render(&LibraryView::default(), None, &["EENG 305".to_string()]);

        assert!(html.contains("EENG 101"));
        assert_eq!(html.matches("favorite-btn active").count(), 1);
        assert_eq!(html.matches("★").count(), 1);
        assert!(html.contains("signin-form"));
    }

    #[test]
    fn test_renders_timer_and_stats() {
        let html = render(&LibraryView::default(), None, &[]);

        assert!(html.contains("25:00"));
        assert!(html.contains("Focus Time"));
        assert!(html.contains(r#"<span id="sessions-completed">4</span>"#));
        assert!(html.contains(r#"stroke-dasharray="691""#));
    }

    #[test]
    fn test_library_collapsed_until_expanded() {
        let html = render(&LibraryView::default(), None, &[]);
        assert!(!html.contains("<figcaption>"));
        assert!(html.contains("Show books"));

        let mut view = LibraryView::default();
        view.toggle();
        let html = render(&view, None, &[]);
        assert!(html.contains("<figcaption>Signals and Systems</figcaption>"));
        assert!(!html.contains("load-more"));
    }

    #[test]
    fn test_signed_in_header() {
        let user = AuthUser {
            uid: "u1".to_string(),
            email: "ada.l@uni.edu".to_string(),
            display_name: None,
            photo_url: None,
            email_verified: true,
        };
        let html = render(&LibraryView::default(), Some(&user), &[]);
        assert!(html.contains("Ada l"));
        assert!(html.contains("signout"));
        assert!(!html.contains("signin-form"));
    }
}

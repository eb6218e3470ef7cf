//! Declarative authorization: one allow-table over `(Action, Role)` instead
//! of role string comparisons scattered through the handlers.

use crate::models::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ListUsers,
    ManageUsers,
    ManageRoles,
    ArchiveUsers,
    ListStudents,
    ManageStudents,
    ManageBooks,
    ManageNotifications,
    ManageDocuments,
    ViewGaDocuments,
    ManageGaDocuments,
    ManageEvents,
    ManageCalendarSettings,
    ExportData,
    ImportData,
    ClearDatabase,
}

const ADMIN_ONLY: &[Role] = &[Role::Admin];
const ADMIN_OR_TUTOR: &[Role] = &[Role::Admin, Role::Tutor];

fn allowed_roles(action: Action) -> &'static [Role] {
    match action {
        Action::ListUsers => ADMIN_OR_TUTOR,
        Action::ManageUsers => ADMIN_ONLY,
        Action::ManageRoles => ADMIN_ONLY,
        Action::ArchiveUsers => ADMIN_ONLY,
        Action::ListStudents => ADMIN_OR_TUTOR,
        Action::ManageStudents => ADMIN_ONLY,
        Action::ManageBooks => ADMIN_OR_TUTOR,
        Action::ManageNotifications => ADMIN_OR_TUTOR,
        Action::ManageDocuments => ADMIN_ONLY,
        // GA sections are visible to any GA member; the membership flag is
        // checked separately by the handler.
        Action::ViewGaDocuments => &[Role::User, Role::Admin, Role::Tutor],
        Action::ManageGaDocuments => ADMIN_ONLY,
        Action::ManageEvents => ADMIN_ONLY,
        Action::ManageCalendarSettings => ADMIN_ONLY,
        Action::ExportData => ADMIN_ONLY,
        Action::ImportData => ADMIN_ONLY,
        Action::ClearDatabase => ADMIN_ONLY,
    }
}

pub fn allows(role: Role, action: Action) -> bool {
    allowed_roles(action).contains(&role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_is_allowed_everything() {
        for action in [
            Action::ListUsers,
            Action::ManageUsers,
            Action::ExportData,
            Action::ImportData,
            Action::ClearDatabase,
            Action::ManageEvents,
        ] {
            assert!(allows(Role::Admin, action));
        }
    }

    #[test]
    fn tutor_can_list_but_not_manage_users() {
        assert!(allows(Role::Tutor, Action::ListUsers));
        assert!(!allows(Role::Tutor, Action::ManageUsers));
        assert!(!allows(Role::Tutor, Action::ImportData));
    }

    #[test]
    fn plain_user_cannot_touch_admin_surfaces() {
        assert!(!allows(Role::User, Action::ListUsers));
        assert!(!allows(Role::User, Action::ExportData));
        assert!(!allows(Role::User, Action::ClearDatabase));
    }
}

//! Predefined roles with default permission sets.
//!
//! Warden ships with five built-in HR roles:
//!
//! | Role        | Description                                                  |
//! |-------------|--------------------------------------------------------------|
//! | OrgAdmin    | Full access to every resource and organization settings      |
//! | HrManager   | Manage employees, leave and notifications; export reports    |
//! | LineManager | Read team records; approve leave requests                    |
//! | Employee    | Read own records; raise leave requests                       |
//! | Auditor     | Read-only access including the audit log                     |

use super::models::{Action, Permission, PermissionSet, Resource, Role};

/// Predefined role templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedRole {
    OrgAdmin,
    HrManager,
    LineManager,
    Employee,
    Auditor,
}

impl PredefinedRole {
    pub fn id(&self) -> &'static str {
        match self {
            Self::OrgAdmin => "org_admin",
            Self::HrManager => "hr_manager",
            Self::LineManager => "line_manager",
            Self::Employee => "employee",
            Self::Auditor => "auditor",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OrgAdmin => "Organization Admin",
            Self::HrManager => "HR Manager",
            Self::LineManager => "Line Manager",
            Self::Employee => "Employee",
            Self::Auditor => "Auditor",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::OrgAdmin => "Full access to every resource and organization settings",
            Self::HrManager => "Manage employees, leave and notifications; export reports",
            Self::LineManager => "Read team records and approve leave requests",
            Self::Employee => "Read own records and raise leave requests",
            Self::Auditor => "Read-only access including the audit log",
        }
    }

    /// Return the set of permissions for this predefined role.
    pub fn permissions(&self) -> PermissionSet {
        use Action::*;
        use Resource::*;

        let grants: &[(Resource, Action)] = match self {
            Self::OrgAdmin => return PermissionSet::all(),
            Self::HrManager => &[
                (Employee, Read),
                (Employee, Create),
                (Employee, Update),
                (LeaveBalance, Read),
                (LeaveBalance, Create),
                (LeaveBalance, Update),
                (LeaveRequest, Read),
                (LeaveRequest, Approve),
                (Notification, Read),
                (Notification, Create),
                (Report, Read),
                (Report, Export),
            ],
            Self::LineManager => &[
                (Employee, Read),
                (LeaveBalance, Read),
                (LeaveRequest, Read),
                (LeaveRequest, Approve),
                (Notification, Read),
            ],
            Self::Employee => &[
                (LeaveBalance, Read),
                (LeaveRequest, Read),
                (LeaveRequest, Create),
                (Notification, Read),
            ],
            Self::Auditor => &[
                (Employee, Read),
                (LeaveBalance, Read),
                (LeaveRequest, Read),
                (Report, Read),
                (AuditLog, Read),
                (AuditLog, Export),
            ],
        };

        grants
            .iter()
            .map(|&(resource, action)| Permission::new(resource, action))
            .collect()
    }

    /// Build a full `Role` struct from this predefined role.
    pub fn to_role(&self) -> Role {
        Role::new(self.id(), self.name(), self.description(), self.permissions()).system()
    }

    pub fn all() -> Vec<PredefinedRole> {
        vec![
            Self::OrgAdmin,
            Self::HrManager,
            Self::LineManager,
            Self::Employee,
            Self::Auditor,
        ]
    }

    /// Return all predefined roles as `Role` structs.
    pub fn all_defaults() -> Vec<Role> {
        Self::all().into_iter().map(|r| r.to_role()).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
